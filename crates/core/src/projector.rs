//! Dual-state projector.
//!
//! The model state (the message transcript) is authoritative; the presentation state is
//! a projection of it. Two regimes produce presentation entries:
//!
//! - replay: [`project`] rebuilds every entry from a finalized [`ModelState`] in one pass;
//! - live: a [`LiveTurn`] feeds streaming deltas into a [`Streamable`] and, through
//!   [`drive_turn`], appends the finalized assistant message to the log.
//!
//! Both regimes use the same rule: every non-system message yields exactly one entry.

use crate::completion::{CompletionChunk, CompletionStream};
use crate::context::ConversationContext;
use crate::error::{CompletionError, TurnError};
use crate::message::{Message, Role, new_id};
use crate::registry::render_function_result;
use crate::streamable::{Streamable, StreamableReader};
use crate::ui::UiNode;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The durable state of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

impl ModelState {
    pub fn new() -> Self {
        Self::with_id(new_id())
    }

    pub fn with_id(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
        }
    }
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a conversation is within a turn.
///
/// LLM turns run `Idle → AwaitingCompletion → Streaming → Finalizing → Idle`;
/// side-effecting actions run `Idle → ResolvingAction → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    AwaitingCompletion,
    Streaming,
    Finalizing,
    ResolvingAction,
}

/// A display that is either fixed or still being produced.
#[derive(Debug, Clone)]
pub enum DisplayHandle {
    Static(UiNode),
    Live(StreamableReader<UiNode>),
}

impl DisplayHandle {
    pub fn current(&self) -> UiNode {
        match self {
            DisplayHandle::Static(node) => node.clone(),
            DisplayHandle::Live(reader) => reader.current(),
        }
    }

    /// Whether the display reached its terminal value.
    pub fn is_done(&self) -> bool {
        match self {
            DisplayHandle::Static(_) => true,
            DisplayHandle::Live(reader) => reader.is_terminal(),
        }
    }

    /// Waits for the terminal value; an abandoned handle settles as an error display.
    pub async fn settle(&self) -> UiNode {
        match self {
            DisplayHandle::Static(node) => node.clone(),
            DisplayHandle::Live(reader) => reader
                .wait()
                .await
                .unwrap_or_else(|e| UiNode::error(e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresentationEntry {
    pub id: String,
    pub display: DisplayHandle,
}

/// Serializable view of a presentation entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub id: String,
    pub display: UiNode,
    pub done: bool,
}

impl PresentationEntry {
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id.clone(),
            display: self.display.current(),
            done: self.display.is_done(),
        }
    }
}

/// Deterministic entry id for the `position`-th displayed message of a conversation.
pub fn entry_id(conversation_id: &str, position: usize) -> String {
    format!("{conversation_id}-{position}")
}

/// Maps one message to its display; system messages are never displayed.
pub fn render_message(message: &Message) -> Option<UiNode> {
    let node = match message.role {
        Role::System => return None,
        Role::User => UiNode::UserMessage {
            content: message.content.clone(),
        },
        Role::Assistant => UiNode::bot(message.content.clone()),
        Role::Function | Role::Tool => {
            render_function_result(message.name.as_deref(), &message.content)
        }
        Role::Data => UiNode::Empty,
    };
    Some(node)
}

/// Rebuilds the full presentation state from a model state.
pub fn project(state: &ModelState) -> Vec<PresentationEntry> {
    state
        .messages
        .iter()
        .filter_map(render_message)
        .enumerate()
        .map(|(position, node)| PresentationEntry {
            id: entry_id(&state.conversation_id, position),
            display: DisplayHandle::Static(node),
        })
        .collect()
}

/// The presentation side of one in-flight assistant turn.
///
/// Starts as a spinner placeholder, becomes a bot message on the first delta and is
/// sealed either with the final content or with an error display. Consuming methods
/// make a double seal impossible.
pub struct LiveTurn {
    ui: Streamable<UiNode>,
    streaming: bool,
}

impl LiveTurn {
    pub fn begin() -> (Self, StreamableReader<UiNode>) {
        let ui = Streamable::new(UiNode::Spinner { label: None });
        let reader = ui.reader();
        (
            Self {
                ui,
                streaming: false,
            },
            reader,
        )
    }

    /// Publishes a delta; returns `true` for the first one.
    pub fn apply(&mut self, chunk: &CompletionChunk) -> bool {
        let first = !self.streaming;
        self.streaming = true;
        self.ui.update(UiNode::bot(chunk.content_so_far.clone()));
        first
    }

    pub fn seal(self, content: impl Into<String>) {
        self.ui.done(UiNode::bot(content));
    }

    pub fn fail(self, reason: &dyn std::error::Error) {
        self.ui.done(UiNode::error(format!(
            "The response could not be completed: {reason}"
        )));
    }
}

/// Consumes a completion stream into `turn`, committing the assistant message on success.
///
/// On failure the handle is sealed with an error display and the partial assistant
/// message is not committed, so the log stays at its last consistent point.
pub async fn drive_turn(
    ctx: &ConversationContext,
    mut stream: CompletionStream,
    mut turn: LiveTurn,
) -> Result<ModelState, TurnError> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) if chunk.is_done => {
                ctx.set_phase(TurnPhase::Finalizing);
                let content = chunk.content_so_far;
                if let Err(e) = ctx.append(Message::assistant(content.clone())) {
                    turn.fail(&e);
                    return Err(e.into());
                }
                turn.seal(content);
                return Ok(ctx.model_state());
            }
            Ok(chunk) => {
                if turn.apply(&chunk) {
                    debug!("First delta received");
                    ctx.set_phase(TurnPhase::Streaming);
                }
            }
            Err(e) => {
                warn!(error = %e, "Completion failed mid-stream");
                turn.fail(&e);
                return Err(e.into());
            }
        }
    }

    let e = CompletionError::Interrupted;
    turn.fail(&e);
    Err(e.into())
}
