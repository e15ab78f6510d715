//! Parley Core
//!
//! The conversation orchestration core: an append-only message log, a streaming
//! completion adapter over any [`llm_client::LLMClient`], the projector that keeps the
//! durable model state and the renderable presentation state in lockstep, the action
//! dispatcher and the session persistence gateway.
//!
//! Nothing in this crate knows about HTTP; the service crate drives it through
//! [`actions::ActionDispatcher`] and reads presentation state through
//! [`projector::project`].

pub mod actions;
pub mod completion;
pub mod context;
pub mod error;
pub mod llm_client;
pub mod log;
pub mod message;
pub mod persistence;
pub mod projector;
pub mod registry;
pub mod streamable;
pub mod ui;

pub use actions::{Action, ActionDispatcher, ActionResponse, ActionResult, PurchaseOutcome};
pub use context::{ConversationContext, Identity};
pub use message::{Message, Role};
pub use persistence::{ChatRecord, ChatStore, MemoryChatStore, SessionGateway};
pub use projector::{DisplayHandle, EntrySnapshot, ModelState, PresentationEntry, TurnPhase, project};
