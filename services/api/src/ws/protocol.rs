//! Defines the WebSocket message protocol between the browser client and the API server.

use parley_core::{Action, EntrySnapshot, ui::UiNode};
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts or resumes a conversation. This must be the first message.
    Init {
        /// The conversation to resume; a new one is started when absent.
        #[serde(default)]
        chat_id: Option<String>,
    },
    SubmitUserMessage {
        content: String,
    },
    ConfirmPurchase {
        symbol: String,
        price: f64,
        amount: u32,
    },
}

impl ClientMessage {
    /// The dispatcher action this message invokes, if any.
    pub fn into_action(self) -> Option<Action> {
        match self {
            ClientMessage::Init { .. } => None,
            ClientMessage::SubmitUserMessage { content } => {
                Some(Action::SubmitUserMessage { content })
            }
            ClientMessage::ConfirmPurchase {
                symbol,
                price,
                amount,
            } => Some(Action::ConfirmPurchase {
                symbol,
                price,
                amount,
            }),
        }
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms initialization and carries the replayed presentation state.
    Initialized {
        chat_id: String,
        ui_state: Vec<EntrySnapshot>,
    },
    /// An action was accepted; its displays follow as `ui_update`s until `done`.
    ActionAccepted {
        action: String,
        handles: Vec<EntrySnapshot>,
    },
    /// A new value of a live display.
    UiUpdate {
        id: String,
        display: UiNode,
        done: bool,
    },
    /// Reports an error to the client.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_parse() {
        let init: ClientMessage = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        assert_eq!(init, ClientMessage::Init { chat_id: None });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"submit_user_message","content":"hello"}"#).unwrap();
        assert_eq!(
            msg.into_action(),
            Some(Action::SubmitUserMessage {
                content: "hello".to_string()
            })
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"confirm_purchase","symbol":"ACME","price":10,"amount":5}"#,
        )
        .unwrap();
        assert_eq!(msg.into_action().unwrap().name(), "confirm_purchase");
    }

    #[test]
    fn test_ui_update_frame() {
        let frame = ServerMessage::UiUpdate {
            id: "abc".to_string(),
            display: UiNode::bot("Hi"),
            done: false,
        };
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["type"], "ui_update");
        assert_eq!(json["display"]["kind"], "bot_message");
        assert_eq!(json["done"], false);
    }
}
