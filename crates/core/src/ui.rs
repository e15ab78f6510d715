//! Renderable presentation nodes.
//!
//! These are the server-side description of what a client renders for a presentation
//! entry. They carry data only; styling is left to the client.

use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiNode {
    UserMessage { content: String },
    BotMessage { content: String },
    BotCard { card: Card },
    SystemMessage { content: String },
    Spinner { label: Option<String> },
    Error { message: String },
    Empty,
}

impl UiNode {
    pub fn bot(content: impl Into<String>) -> Self {
        Self::BotMessage {
            content: content.into(),
        }
    }

    pub fn spinner(label: impl Into<String>) -> Self {
        Self::Spinner {
            label: Some(label.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Structured displays for known function results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Card {
    Stocks { stocks: Vec<StockQuote> },
    Stock(StockQuote),
    Purchase(PurchaseCard),
    Events { events: Vec<StockEvent> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    #[default]
    RequiresAction,
    Completed,
    Expired,
}

fn default_purchase_amount() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCard {
    pub symbol: String,
    #[serde(serialize_with = "serialize_number")]
    pub price: f64,
    #[serde(alias = "numberOfShares", default = "default_purchase_amount")]
    pub default_amount: u32,
    #[serde(default)]
    pub status: PurchaseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEvent {
    pub date: String,
    pub headline: String,
    pub description: String,
}

/// Writes whole numbers without a fractional part, so `10.0` becomes `10`.
fn serialize_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() <= MAX_EXACT {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Formats an amount as US dollars with thousands separators, e.g. `$1,234.50`.
pub fn format_usd(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{cents}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(50.0), "$50.00");
        assert_eq!(format_usd(1234.5), "$1,234.50");
        assert_eq!(format_usd(1_000_000.0), "$1,000,000.00");
        assert_eq!(format_usd(0.0), "$0.00");
        assert_eq!(format_usd(-12.5), "-$12.50");
    }

    #[test]
    fn test_ui_node_is_tagged_by_kind() {
        let json = serde_json::to_value(UiNode::bot("Hi there")).unwrap();
        assert_eq!(json["kind"], "bot_message");
        assert_eq!(json["content"], "Hi there");

        let json = serde_json::to_value(UiNode::Empty).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "empty" }));
    }

    #[test]
    fn test_purchase_card_accepts_number_of_shares_alias() {
        let card: PurchaseCard =
            serde_json::from_str(r#"{"symbol":"DOGE","price":0.1,"numberOfShares":20}"#).unwrap();
        assert_eq!(card.default_amount, 20);
        assert_eq!(card.status, PurchaseStatus::RequiresAction);

        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["defaultAmount"], 20);
        assert_eq!(json["status"], "requires_action");
    }

    #[test]
    fn test_purchase_card_writes_whole_prices_as_integers() {
        let card = PurchaseCard {
            symbol: "ACME".to_string(),
            price: 10.0,
            default_amount: 5,
            status: PurchaseStatus::Completed,
        };
        assert_eq!(
            serde_json::to_string(&card).unwrap(),
            r#"{"symbol":"ACME","price":10,"defaultAmount":5,"status":"completed"}"#
        );

        let card = PurchaseCard { price: 0.1, ..card };
        assert!(serde_json::to_string(&card).unwrap().contains(r#""price":0.1,"#));
    }
}
