//! Closed registry mapping function-result names to structured displays.
//!
//! Every function a dispatcher action can write into the log must have a variant here.
//! Names that are not registered render as [`UiNode::Empty`] so that transcripts written
//! by newer versions still replay.

use crate::ui::{Card, PurchaseCard, StockEvent, StockQuote, UiNode};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    ListStocks,
    ShowStockPrice,
    ShowStockPurchase,
    GetEvents,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 4] = [
        FunctionKind::ListStocks,
        FunctionKind::ShowStockPrice,
        FunctionKind::ShowStockPurchase,
        FunctionKind::GetEvents,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FunctionKind::ListStocks => "listStocks",
            FunctionKind::ShowStockPrice => "showStockPrice",
            FunctionKind::ShowStockPurchase => "showStockPurchase",
            FunctionKind::GetEvents => "getEvents",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Parses a JSON payload of this kind into its card.
    pub fn render(self, content: &str) -> Result<Card, serde_json::Error> {
        let card = match self {
            FunctionKind::ListStocks => Card::Stocks {
                stocks: serde_json::from_str::<Vec<StockQuote>>(content)?,
            },
            FunctionKind::ShowStockPrice => Card::Stock(serde_json::from_str(content)?),
            FunctionKind::ShowStockPurchase => {
                Card::Purchase(serde_json::from_str::<PurchaseCard>(content)?)
            }
            FunctionKind::GetEvents => Card::Events {
                events: serde_json::from_str::<Vec<StockEvent>>(content)?,
            },
        };
        Ok(card)
    }
}

/// Renders a function or tool result, falling back to an empty display.
pub fn render_function_result(name: Option<&str>, content: &str) -> UiNode {
    let Some(kind) = name.and_then(FunctionKind::from_name) else {
        return UiNode::Empty;
    };
    match kind.render(content) {
        Ok(card) => UiNode::BotCard { card },
        Err(e) => {
            warn!(function = kind.name(), error = %e, "Unreadable function result payload");
            UiNode::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::PurchaseStatus;

    #[test]
    fn test_names_round_trip() {
        for kind in FunctionKind::ALL {
            assert_eq!(FunctionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(FunctionKind::from_name("showWeather"), None);
    }

    #[test]
    fn test_purchase_result_renders_card() {
        let node = render_function_result(
            Some("showStockPurchase"),
            r#"{"symbol":"ACME","price":10,"defaultAmount":5,"status":"completed"}"#,
        );
        assert_eq!(
            node,
            UiNode::BotCard {
                card: Card::Purchase(PurchaseCard {
                    symbol: "ACME".to_string(),
                    price: 10.0,
                    default_amount: 5,
                    status: PurchaseStatus::Completed,
                })
            }
        );
    }

    #[test]
    fn test_list_and_events_render() {
        let stocks = render_function_result(
            Some("listStocks"),
            r#"[{"symbol":"A","price":1.5,"delta":0.1},{"symbol":"B","price":2,"delta":-1}]"#,
        );
        assert!(matches!(stocks, UiNode::BotCard { card: Card::Stocks { ref stocks } } if stocks.len() == 2));

        let events = render_function_result(
            Some("getEvents"),
            r#"[{"date":"2024-01-01","headline":"Up","description":"Went up"}]"#,
        );
        assert!(matches!(events, UiNode::BotCard { card: Card::Events { .. } }));

        let price = render_function_result(
            Some("showStockPrice"),
            r#"{"symbol":"A","price":1,"delta":0}"#,
        );
        assert!(matches!(price, UiNode::BotCard { card: Card::Stock(_) }));
    }

    #[test]
    fn test_unknown_or_missing_name_is_empty() {
        assert_eq!(render_function_result(Some("showWeather"), "{}"), UiNode::Empty);
        assert_eq!(render_function_result(None, "{}"), UiNode::Empty);
    }

    #[test]
    fn test_malformed_payload_is_empty() {
        assert_eq!(
            render_function_result(Some("listStocks"), "not json"),
            UiNode::Empty
        );
    }
}
