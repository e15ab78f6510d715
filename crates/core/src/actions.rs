//! Server-executed actions.
//!
//! Every action returns its display handles synchronously and finishes its work in a
//! detached task. That task owns every handle it was given and seals each one, on the
//! error paths too.

use crate::completion::complete_streaming;
use crate::context::ConversationContext;
use crate::error::DispatchError;
use crate::llm_client::LLMClient;
use crate::log::MessageLog;
use crate::message::{Message, Role, new_id};
use crate::persistence::SessionGateway;
use crate::projector::{DisplayHandle, EntrySnapshot, LiveTurn, TurnPhase, drive_turn};
use crate::registry::FunctionKind;
use crate::streamable::Streamable;
use crate::ui::{PurchaseCard, PurchaseStatus, UiNode, format_usd};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const MIN_PURCHASE_AMOUNT: u32 = 1;
pub const MAX_PURCHASE_AMOUNT: u32 = 1000;
pub const INVALID_AMOUNT_NOTE: &str = "[User has selected an invalid amount]";

const DEFAULT_PURCHASE_STEP: Duration = Duration::from_millis(1000);

/// A named action a client may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    SubmitUserMessage {
        content: String,
    },
    ConfirmPurchase {
        symbol: String,
        price: f64,
        amount: u32,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SubmitUserMessage { .. } => "submit_user_message",
            Action::ConfirmPurchase { .. } => "confirm_purchase",
        }
    }
}

/// A display handed back to the caller, keyed by a fresh identifier.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub id: String,
    pub display: DisplayHandle,
}

impl ActionResult {
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id.clone(),
            display: self.display.current(),
            done: self.display.is_done(),
        }
    }

    fn live(display: &Streamable<UiNode>) -> Self {
        Self {
            id: new_id(),
            display: DisplayHandle::Live(display.reader()),
        }
    }

    fn sealed(node: UiNode) -> Self {
        Self {
            id: new_id(),
            display: DisplayHandle::Static(node),
        }
    }
}

/// The two displays of a purchase: its progress and the companion notification.
#[derive(Debug, Clone)]
pub struct PurchaseOutcome {
    pub purchasing_ui: ActionResult,
    pub new_message: ActionResult,
}

#[derive(Debug, Clone)]
pub enum ActionResponse {
    Message(ActionResult),
    Purchase(PurchaseOutcome),
}

impl ActionResponse {
    /// All handles of the response in display order.
    pub fn handles(&self) -> Vec<&ActionResult> {
        match self {
            ActionResponse::Message(result) => vec![result],
            ActionResponse::Purchase(outcome) => vec![&outcome.purchasing_ui, &outcome.new_message],
        }
    }
}

/// Runs actions against a conversation context.
#[derive(Clone)]
pub struct ActionDispatcher {
    llm_client: Arc<dyn LLMClient>,
    gateway: SessionGateway,
    system_prompt: Arc<str>,
    purchase_step: Duration,
}

impl ActionDispatcher {
    pub fn new(
        llm_client: Arc<dyn LLMClient>,
        gateway: SessionGateway,
        system_prompt: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            llm_client,
            gateway,
            system_prompt: system_prompt.into(),
            purchase_step: DEFAULT_PURCHASE_STEP,
        }
    }

    /// Sets the delay between purchase progress states.
    pub fn with_purchase_step(mut self, step: Duration) -> Self {
        self.purchase_step = step;
        self
    }

    pub fn gateway(&self) -> &SessionGateway {
        &self.gateway
    }

    pub fn dispatch(
        &self,
        ctx: &ConversationContext,
        action: Action,
    ) -> Result<ActionResponse, DispatchError> {
        debug!(
            conversation_id = %ctx.conversation_id(),
            action = action.name(),
            "Dispatching action"
        );
        match action {
            Action::SubmitUserMessage { content } => self
                .submit_user_message(ctx, content)
                .map(ActionResponse::Message),
            Action::ConfirmPurchase {
                symbol,
                price,
                amount,
            } => self
                .confirm_purchase(ctx, symbol, price, amount)
                .map(ActionResponse::Purchase),
        }
    }

    /// Appends the user message and starts the assistant turn.
    ///
    /// The returned display starts as a spinner; the turn itself runs detached and the
    /// context returns to [`TurnPhase::Idle`] once the turn is sealed and persistence
    /// has been requested.
    pub fn submit_user_message(
        &self,
        ctx: &ConversationContext,
        content: String,
    ) -> Result<ActionResult, DispatchError> {
        ctx.try_begin(TurnPhase::AwaitingCompletion)?;
        if let Err(e) = ctx.append(Message::user(content)) {
            ctx.set_phase(TurnPhase::Idle);
            return Err(e.into());
        }

        let (turn, reader) = LiveTurn::begin();
        let span = info_span!("turn", conversation_id = %ctx.conversation_id());
        tokio::spawn(
            run_turn(
                Arc::clone(&self.llm_client),
                self.gateway.clone(),
                Arc::clone(&self.system_prompt),
                ctx.clone(),
                turn,
            )
            .instrument(span),
        );

        Ok(ActionResult {
            id: new_id(),
            display: DisplayHandle::Live(reader),
        })
    }

    /// Confirms a stock purchase without involving the model.
    ///
    /// Invalid amounts are rejected immediately with sealed displays. Otherwise the
    /// purchase display steps through its progress states and the function result and
    /// system note land in the log only after this call has returned.
    pub fn confirm_purchase(
        &self,
        ctx: &ConversationContext,
        symbol: String,
        price: f64,
        amount: u32,
    ) -> Result<PurchaseOutcome, DispatchError> {
        ctx.try_begin(TurnPhase::ResolvingAction)?;

        if !is_valid_purchase(price, amount) {
            return self.reject_purchase(ctx, &symbol, price, amount);
        }

        let mut purchasing = Streamable::new(UiNode::spinner(format!(
            "Purchasing {amount} ${symbol}..."
        )));
        let system_note = Streamable::new(UiNode::Empty);
        let outcome = PurchaseOutcome {
            purchasing_ui: ActionResult::live(&purchasing),
            new_message: ActionResult::live(&system_note),
        };

        let ctx = ctx.clone();
        let gateway = self.gateway.clone();
        let step = self.purchase_step;
        let span = info_span!(
            "purchase",
            conversation_id = %ctx.conversation_id(),
            %symbol,
            amount
        );
        tokio::spawn(
            async move {
                tokio::time::sleep(step).await;
                purchasing.update(UiNode::spinner(format!(
                    "Purchasing {amount} ${symbol}... working on it..."
                )));
                tokio::time::sleep(step).await;

                let recorded = record_purchase(&ctx, &symbol, price, amount);
                seal_purchase(purchasing, system_note, recorded, &symbol, price, amount);

                gateway.persist_detached(ctx.model_state(), ctx.identity().cloned());
                ctx.set_phase(TurnPhase::Idle);
            }
            .instrument(span),
        );

        Ok(outcome)
    }

    fn reject_purchase(
        &self,
        ctx: &ConversationContext,
        symbol: &str,
        price: f64,
        amount: u32,
    ) -> Result<PurchaseOutcome, DispatchError> {
        warn!(
            conversation_id = %ctx.conversation_id(),
            symbol,
            price,
            amount,
            "Rejected purchase with invalid amount"
        );
        let appended = ctx.append(Message::system(INVALID_AMOUNT_NOTE));
        if appended.is_ok() {
            self.gateway
                .persist_detached(ctx.model_state(), ctx.identity().cloned());
        }
        ctx.set_phase(TurnPhase::Idle);
        appended?;

        Ok(PurchaseOutcome {
            purchasing_ui: ActionResult::sealed(UiNode::error("Invalid amount")),
            new_message: ActionResult::sealed(UiNode::SystemMessage {
                content: INVALID_AMOUNT_NOTE.to_string(),
            }),
        })
    }
}

/// Seals both purchase displays with the outcome of recording the purchase.
fn seal_purchase(
    purchasing: Streamable<UiNode>,
    system_note: Streamable<UiNode>,
    recorded: Result<(), DispatchError>,
    symbol: &str,
    price: f64,
    amount: u32,
) {
    let total = f64::from(amount) * price;
    match recorded {
        Ok(()) => {
            purchasing.done(UiNode::bot(format!(
                "You have successfully purchased {amount} ${symbol}. Total cost: {}",
                format_usd(total)
            )));
            system_note.done(UiNode::SystemMessage {
                content: format!(
                    "You have purchased {amount} shares of {symbol} at ${price}. Total cost = {}.",
                    format_usd(total)
                ),
            });
            info!("Purchase recorded");
        }
        Err(e) => {
            error!(error = %e, "Failed to record purchase");
            let message = format!("The purchase could not be completed: {e}");
            purchasing.done(UiNode::error(message.clone()));
            system_note.done(UiNode::error(message));
        }
    }
}

fn is_valid_purchase(price: f64, amount: u32) -> bool {
    (MIN_PURCHASE_AMOUNT..=MAX_PURCHASE_AMOUNT).contains(&amount) && price.is_finite() && price > 0.0
}

async fn run_turn(
    llm_client: Arc<dyn LLMClient>,
    gateway: SessionGateway,
    system_prompt: Arc<str>,
    ctx: ConversationContext,
    turn: LiveTurn,
) {
    let prior = ctx.snapshot();
    let result = match complete_streaming(llm_client.as_ref(), &system_prompt, &prior).await {
        Ok(stream) => drive_turn(&ctx, stream, turn).await,
        Err(e) => {
            turn.fail(&e);
            Err(e.into())
        }
    };

    match result {
        Ok(state) => {
            info!(messages = state.messages.len(), "Turn finalized");
            gateway.persist_detached(state, ctx.identity().cloned());
        }
        Err(e) => warn!(error = %e, "Turn failed; assistant message not committed"),
    }
    ctx.set_phase(TurnPhase::Idle);
}

/// Writes the completed purchase into the log, replacing a pending purchase card.
fn record_purchase(
    ctx: &ConversationContext,
    symbol: &str,
    price: f64,
    amount: u32,
) -> Result<(), DispatchError> {
    let card = PurchaseCard {
        symbol: symbol.to_string(),
        price,
        default_amount: amount,
        status: PurchaseStatus::Completed,
    };
    let result = Message::function(
        FunctionKind::ShowStockPurchase.name(),
        serde_json::to_string(&card)?,
    );
    let note = Message::system(format!(
        "[User has purchased {amount} shares of {symbol} at {price}. Total cost = {}]",
        f64::from(amount) * price
    ));

    ctx.with_log(|log| {
        let provisional = usize::from(has_pending_purchase(log));
        log.replace_tail(provisional, vec![result, note])
    })?;
    Ok(())
}

fn has_pending_purchase(log: &MessageLog) -> bool {
    log.last().is_some_and(|message| {
        message.role == Role::Function
            && message.name.as_deref() == Some(FunctionKind::ShowStockPurchase.name())
            && serde_json::from_str::<PurchaseCard>(&message.content)
                .is_ok_and(|card| card.status == PurchaseStatus::RequiresAction)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompletionError, ConsistencyError};
    use crate::llm_client::MockLLMClient;
    use crate::persistence::MemoryChatStore;
    use crate::streamable::StreamStatus;

    fn dispatcher(client: MockLLMClient) -> ActionDispatcher {
        let gateway = SessionGateway::new(Arc::new(MemoryChatStore::new()));
        ActionDispatcher::new(Arc::new(client), gateway, "You are a stock trading assistant.")
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_str(
            r#"{"action":"confirm_purchase","symbol":"ACME","price":10.0,"amount":5}"#,
        )
        .unwrap();
        assert_eq!(action.name(), "confirm_purchase");
        assert_eq!(
            action,
            Action::ConfirmPurchase {
                symbol: "ACME".to_string(),
                price: 10.0,
                amount: 5,
            }
        );
    }

    #[test]
    fn test_purchase_validation_bounds() {
        assert!(is_valid_purchase(10.0, 1));
        assert!(is_valid_purchase(10.0, 1000));
        assert!(!is_valid_purchase(10.0, 0));
        assert!(!is_valid_purchase(10.0, 1001));
        assert!(!is_valid_purchase(0.0, 5));
        assert!(!is_valid_purchase(f64::NAN, 5));
    }

    #[tokio::test]
    async fn test_submit_returns_spinner_before_completion() {
        let dispatcher = dispatcher(MockLLMClient::new(["Hi", " there"]));
        let ctx = ConversationContext::new(None);

        let result = dispatcher
            .submit_user_message(&ctx, "hello".to_string())
            .unwrap();
        assert_eq!(result.display.current(), UiNode::Spinner { label: None });

        ctx.wait_for_idle().await;
        assert_eq!(result.display.settle().await, UiNode::bot("Hi there"));
    }

    #[tokio::test]
    async fn test_overlapping_turn_is_rejected() {
        let dispatcher = dispatcher(MockLLMClient::new(["Hi"]));
        let ctx = ConversationContext::new(None);

        dispatcher
            .submit_user_message(&ctx, "first".to_string())
            .unwrap();
        let second = dispatcher.submit_user_message(&ctx, "second".to_string());
        assert!(matches!(second, Err(DispatchError::TurnInProgress(_))));

        ctx.wait_for_idle().await;
        assert_eq!(ctx.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_provider_seals_with_error() {
        let dispatcher = dispatcher(MockLLMClient::unavailable(CompletionError::Network(
            "connection refused".to_string(),
        )));
        let ctx = ConversationContext::new(None);

        let result = dispatcher
            .submit_user_message(&ctx, "hello".to_string())
            .unwrap();
        ctx.wait_for_idle().await;

        let DisplayHandle::Live(reader) = &result.display else {
            panic!("expected a live display");
        };
        assert_eq!(reader.status(), StreamStatus::Done);
        assert!(matches!(reader.current(), UiNode::Error { .. }));
        assert_eq!(ctx.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_amount_is_rejected_with_sealed_displays() {
        let dispatcher = dispatcher(MockLLMClient::new(Vec::<String>::new()));
        let ctx = ConversationContext::new(None);

        let outcome = dispatcher
            .confirm_purchase(&ctx, "ACME".to_string(), 10.0, 0)
            .unwrap();

        assert!(outcome.purchasing_ui.display.is_done());
        assert_eq!(
            outcome.purchasing_ui.display.current(),
            UiNode::error("Invalid amount")
        );
        assert_eq!(ctx.phase(), TurnPhase::Idle);
        let log = ctx.snapshot();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, INVALID_AMOUNT_NOTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purchase_replaces_pending_card() {
        let dispatcher = dispatcher(MockLLMClient::new(Vec::<String>::new()));
        let ctx = ConversationContext::new(None);
        ctx.append(Message::function(
            "showStockPurchase",
            r#"{"symbol":"ACME","price":10,"numberOfShares":100,"status":"requires_action"}"#,
        ))
        .unwrap();

        let outcome = dispatcher
            .confirm_purchase(&ctx, "ACME".to_string(), 10.0, 5)
            .unwrap();
        assert_eq!(
            outcome.purchasing_ui.display.current(),
            UiNode::spinner("Purchasing 5 $ACME...")
        );

        ctx.wait_for_idle().await;
        let log = ctx.snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::Function);
        assert!(log[0].content.contains(r#""status":"completed""#));
        assert_eq!(
            log[1].content,
            "[User has purchased 5 shares of ACME at 10. Total cost = 50]"
        );
        assert_eq!(
            outcome.new_message.display.settle().await,
            UiNode::SystemMessage {
                content: "You have purchased 5 shares of ACME at $10. Total cost = $50.00."
                    .to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purchase_progress_states_in_order() {
        let dispatcher = dispatcher(MockLLMClient::new(Vec::<String>::new()));
        let ctx = ConversationContext::new(None);

        let outcome = dispatcher
            .confirm_purchase(&ctx, "ACME".to_string(), 10.0, 5)
            .unwrap();
        ctx.wait_for_idle().await;

        let DisplayHandle::Live(reader) = &outcome.purchasing_ui.display else {
            panic!("expected a live display");
        };
        assert_eq!(
            reader.history(),
            vec![
                UiNode::spinner("Purchasing 5 $ACME..."),
                UiNode::spinner("Purchasing 5 $ACME... working on it..."),
                UiNode::bot("You have successfully purchased 5 $ACME. Total cost: $50.00"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_recording_seals_both_displays_with_error() {
        let purchasing = Streamable::new(UiNode::spinner("Purchasing 5 $ACME..."));
        let system_note = Streamable::new(UiNode::Empty);
        let purchasing_ui = purchasing.reader();
        let new_message = system_note.reader();

        let recorded = Err(DispatchError::from(ConsistencyError::TailOutOfRange {
            requested: 1,
            len: 0,
        }));
        seal_purchase(purchasing, system_note, recorded, "ACME", 10.0, 5);

        for reader in [&purchasing_ui, &new_message] {
            assert_eq!(reader.status(), StreamStatus::Done);
            let UiNode::Error { message } = reader.wait().await.unwrap() else {
                panic!("expected an error display");
            };
            assert!(message.starts_with("The purchase could not be completed"));
        }
    }
}
