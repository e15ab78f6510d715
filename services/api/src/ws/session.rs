//! Manages the WebSocket connection lifecycle of a conversation.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{auth::identity_from_headers, state::AppState};
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::{
    Action, ConversationContext, DisplayHandle, EntrySnapshot, Identity, ModelState,
    PresentationEntry, project,
    streamable::{StreamStatus, StreamableReader},
    ui::UiNode,
};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let identity = identity_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Main handler for an individual WebSocket connection.
///
/// Performs the `init` handshake, which starts or resumes a conversation, and then
/// spawns the action loop for the connection.
#[instrument(name = "ws_session", skip_all, fields(chat_id, authenticated = identity.is_some()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    info!("New WebSocket connection. Awaiting initialization...");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => {
            initialize_conversation(text.as_str(), &state, identity).await
        }
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };

    let (ctx, ui_state) = match init {
        Ok(initialized) => initialized,
        Err(e) => {
            error!("Conversation initialization failed: {:?}", e);
            let _ = send_msg(
                &socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("chat_id", ctx.conversation_id());

    if send_msg(
        &socket_tx,
        ServerMessage::Initialized {
            chat_id: ctx.conversation_id().to_string(),
            ui_state,
        },
    )
    .await
    .is_err()
    {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let session_span = info_span!("action_session", chat_id = %ctx.conversation_id());
    tokio::spawn(
        async move {
            if let Err(e) = run_action_session(state, socket_tx, socket_rx, ctx).await {
                error!(error = ?e, "Action session terminated with error.");
            }
            info!("Action session finished.");
        }
        .instrument(session_span),
    );
}

/// Parses the `init` message and builds the conversation context.
///
/// An authenticated owner resumes a stored chat together with its replayed
/// presentation state. Anyone else, or an unknown chat id, starts from an empty
/// transcript.
async fn initialize_conversation(
    init_text: &str,
    state: &AppState,
    identity: Option<Identity>,
) -> Result<(ConversationContext, Vec<EntrySnapshot>)> {
    let ClientMessage::Init { chat_id } = serde_json::from_str::<ClientMessage>(init_text)? else {
        return Err(anyhow!("First message must be `init`"));
    };

    let model_state = match (chat_id, &identity) {
        (Some(chat_id), Some(owner)) => match state.gateway.load(owner, &chat_id).await? {
            Some(record) => {
                info!(%chat_id, "Resuming existing chat");
                record.model_state()
            }
            None => ModelState::with_id(chat_id),
        },
        (Some(chat_id), None) => ModelState::with_id(chat_id),
        (None, _) => ModelState::new(),
    };

    let ui_state = project(&model_state)
        .iter()
        .map(PresentationEntry::snapshot)
        .collect();
    let ctx = ConversationContext::resume(model_state, identity)?;
    Ok((ctx, ui_state))
}

/// The main event loop of an initialized connection.
///
/// Every accepted action gets its displays forwarded as `ui_update` frames by
/// background tasks, which are aborted when the client goes away.
async fn run_action_session(
    state: Arc<AppState>,
    socket_tx: SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    ctx: ConversationContext,
) -> Result<()> {
    let mut forwarders = JoinSet::new();

    while let Some(msg_result) = socket_rx.next().await {
        while forwarders.try_join_next().is_some() {}

        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(msg) => match msg.into_action() {
                    Some(action) => {
                        dispatch_action(&state, &ctx, action, &socket_tx, &mut forwarders).await?
                    }
                    None => warn!("Ignoring repeated `init` message."),
                },
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed client message.");
                    send_msg(
                        &socket_tx,
                        ServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        },
                    )
                    .await?;
                }
            },
            Ok(Message::Close(_)) => {
                info!("Client sent close frame. Shutting down session.");
                break;
            }
            Ok(Message::Binary(_)) => warn!("Ignoring binary message."),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        }
    }

    // Detached turns keep running and persisting; only the forwarding stops.
    forwarders.abort_all();
    info!("WebSocket connection closed.");
    Ok(())
}

async fn dispatch_action(
    state: &AppState,
    ctx: &ConversationContext,
    action: Action,
    socket_tx: &SocketSink,
    forwarders: &mut JoinSet<()>,
) -> Result<()> {
    let action_name = action.name();
    let response = match state.dispatcher.dispatch(ctx, action) {
        Ok(response) => response,
        Err(e) => {
            warn!(action = action_name, error = %e, "Action rejected");
            return send_msg(
                socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    };

    let handles = response.handles();
    send_msg(
        socket_tx,
        ServerMessage::ActionAccepted {
            action: action_name.to_string(),
            handles: handles.iter().map(|handle| handle.snapshot()).collect(),
        },
    )
    .await?;

    for handle in handles {
        if let DisplayHandle::Live(reader) = &handle.display {
            let id = handle.id.clone();
            let span = info_span!("forward_updates", display_id = %id);
            let forward = forward_updates(id, reader.clone(), Arc::clone(socket_tx));
            forwarders.spawn(
                async move {
                    if let Err(e) = forward.await {
                        debug!(error = %e, "Stopped forwarding display updates");
                    }
                }
                .instrument(span),
            );
        }
    }
    Ok(())
}

/// Sends every value of a live display in emission order.
///
/// A display whose producer vanished without sealing it is closed with an error
/// display, so the client never shows a spinner forever.
async fn forward_updates(
    id: String,
    mut reader: StreamableReader<UiNode>,
    socket_tx: SocketSink,
) -> Result<()> {
    while let Some(update) = reader.next().await {
        send_msg(
            &socket_tx,
            ServerMessage::UiUpdate {
                id: id.clone(),
                display: update.value,
                done: update.is_final,
            },
        )
        .await?;
    }

    if reader.status() == StreamStatus::Abandoned {
        send_msg(
            &socket_tx,
            ServerMessage::UiUpdate {
                id,
                display: UiNode::error("The response was interrupted."),
                done: true,
            },
        )
        .await?;
    }
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(socket_tx: &SocketSink, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx
        .lock()
        .await
        .send(Message::Text(serialized.into()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{MemoryChatStore, Message as ChatMessage, llm_client::MockLLMClient};
    use std::time::Duration;

    async fn state_with_chat() -> AppState {
        let state = AppState::new(
            Arc::new(MemoryChatStore::new()),
            Arc::new(MockLLMClient::new(["Hi"])),
            "You are a stock trading assistant.",
            Duration::from_millis(10),
        );
        let stored = ModelState {
            conversation_id: "chat-1".to_string(),
            messages: vec![
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hi there"),
            ],
        };
        state
            .gateway
            .persist(&stored, Some(&Identity::new("u1")))
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_owner_resumes_with_replayed_ui_state() {
        let state = state_with_chat().await;

        let (ctx, ui_state) = initialize_conversation(
            r#"{"type":"init","chat_id":"chat-1"}"#,
            &state,
            Some(Identity::new("u1")),
        )
        .await
        .unwrap();

        assert_eq!(ctx.conversation_id(), "chat-1");
        assert_eq!(ctx.snapshot().len(), 2);
        let ids: Vec<_> = ui_state.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["chat-1-0", "chat-1-1"]);
        assert_eq!(
            ui_state[0].display,
            UiNode::UserMessage {
                content: "hello".to_string()
            }
        );
        assert_eq!(ui_state[1].display, UiNode::bot("Hi there"));
        assert!(ui_state.iter().all(|entry| entry.done));
    }

    #[tokio::test]
    async fn test_anonymous_client_cannot_resume_a_stored_chat() {
        let state = state_with_chat().await;

        let (ctx, ui_state) =
            initialize_conversation(r#"{"type":"init","chat_id":"chat-1"}"#, &state, None)
                .await
                .unwrap();

        assert_eq!(ctx.conversation_id(), "chat-1");
        assert!(ctx.snapshot().is_empty());
        assert!(ui_state.is_empty());
    }

    #[tokio::test]
    async fn test_other_owner_cannot_resume_a_stored_chat() {
        let state = state_with_chat().await;

        let (ctx, ui_state) = initialize_conversation(
            r#"{"type":"init","chat_id":"chat-1"}"#,
            &state,
            Some(Identity::new("u2")),
        )
        .await
        .unwrap();

        assert!(ctx.snapshot().is_empty());
        assert!(ui_state.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_chat_starts_empty_under_its_id() {
        let state = state_with_chat().await;

        let (ctx, ui_state) = initialize_conversation(
            r#"{"type":"init","chat_id":"chat-9"}"#,
            &state,
            Some(Identity::new("u1")),
        )
        .await
        .unwrap();

        assert_eq!(ctx.conversation_id(), "chat-9");
        assert!(ctx.snapshot().is_empty());
        assert!(ui_state.is_empty());
    }

    #[tokio::test]
    async fn test_init_without_chat_id_starts_a_new_chat() {
        let state = state_with_chat().await;

        let (ctx, ui_state) = initialize_conversation(r#"{"type":"init"}"#, &state, None)
            .await
            .unwrap();

        assert_ne!(ctx.conversation_id(), "chat-1");
        assert!(!ctx.conversation_id().is_empty());
        assert!(ui_state.is_empty());
    }

    #[tokio::test]
    async fn test_first_message_must_be_init() {
        let state = state_with_chat().await;

        let result = initialize_conversation(
            r#"{"type":"submit_user_message","content":"hello"}"#,
            &state,
            None,
        )
        .await;

        assert!(result.is_err());
    }
}
