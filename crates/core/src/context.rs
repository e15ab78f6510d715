//! Per-conversation context threaded through every dispatcher action.

use crate::error::{ConsistencyError, DispatchError};
use crate::log::MessageLog;
use crate::message::{Message, new_id};
use crate::projector::{ModelState, TurnPhase};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// The authenticated owner of a request, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

struct Inner {
    conversation_id: String,
    identity: Option<Identity>,
    log: Mutex<MessageLog>,
    phase: watch::Sender<TurnPhase>,
}

/// Owns the message log of one conversation and tracks its turn phase.
///
/// Cloning is cheap and shares the same log, which lets detached continuations keep
/// mutating the conversation after the action that spawned them has returned.
/// The log lock is never held across an await point.
#[derive(Clone)]
pub struct ConversationContext {
    inner: Arc<Inner>,
}

impl ConversationContext {
    /// Starts an empty conversation with a fresh identifier.
    pub fn new(identity: Option<Identity>) -> Self {
        Self::build(new_id(), MessageLog::new(), identity)
    }

    /// Resumes a conversation from a finalized model state.
    pub fn resume(state: ModelState, identity: Option<Identity>) -> Result<Self, ConsistencyError> {
        let log = MessageLog::from_messages(state.messages)?;
        Ok(Self::build(state.conversation_id, log, identity))
    }

    fn build(conversation_id: String, log: MessageLog, identity: Option<Identity>) -> Self {
        let (phase, _) = watch::channel(TurnPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                conversation_id,
                identity,
                log: Mutex::new(log),
                phase,
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.inner.identity.as_ref()
    }

    fn log(&self) -> MutexGuard<'_, MessageLog> {
        self.inner.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, message: Message) -> Result<(), ConsistencyError> {
        self.log().append(message)
    }

    /// Runs `f` with exclusive access to the log.
    pub fn with_log<R>(&self, f: impl FnOnce(&mut MessageLog) -> R) -> R {
        f(&mut self.log())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.log().snapshot()
    }

    pub fn model_state(&self) -> ModelState {
        ModelState {
            conversation_id: self.inner.conversation_id.clone(),
            messages: self.snapshot(),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        *self.inner.phase.borrow()
    }

    pub(crate) fn set_phase(&self, phase: TurnPhase) {
        self.inner.phase.send_replace(phase);
    }

    /// Moves an idle conversation into `phase`, refusing overlapping turns.
    pub(crate) fn try_begin(&self, phase: TurnPhase) -> Result<(), DispatchError> {
        let mut started = false;
        self.inner.phase.send_if_modified(|current| {
            if *current == TurnPhase::Idle {
                *current = phase;
                started = true;
            }
            started
        });
        if started {
            Ok(())
        } else {
            Err(DispatchError::TurnInProgress(
                self.inner.conversation_id.clone(),
            ))
        }
    }

    /// Resolves once no turn or action continuation is in flight.
    pub async fn wait_for_idle(&self) {
        let mut phase = self.inner.phase.subscribe();
        let _ = phase.wait_for(|p| *p == TurnPhase::Idle).await;
    }
}

impl std::fmt::Debug for ConversationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationContext")
            .field("conversation_id", &self.inner.conversation_id)
            .field("identity", &self.inner.identity)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn test_new_context_is_idle_and_empty() {
        let ctx = ConversationContext::new(None);
        assert_eq!(ctx.phase(), TurnPhase::Idle);
        assert!(ctx.snapshot().is_empty());
        assert!(!ctx.conversation_id().is_empty());
        assert!(ctx.identity().is_none());
    }

    #[test]
    fn test_resume_keeps_id_and_messages() {
        let state = ModelState {
            conversation_id: "chat-1".to_string(),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
        };
        let ctx = ConversationContext::resume(state.clone(), Some(Identity::new("u1"))).unwrap();
        assert_eq!(ctx.conversation_id(), "chat-1");
        assert_eq!(ctx.model_state(), state);
        assert_eq!(ctx.identity().unwrap().user_id, "u1");
    }

    #[test]
    fn test_clones_share_the_log() {
        let ctx = ConversationContext::new(None);
        let other = ctx.clone();
        other.append(Message::user("shared")).unwrap();
        assert_eq!(ctx.snapshot().len(), 1);
        assert_eq!(ctx.with_log(|log| log.last().map(|m| m.role)), Some(Role::User));
    }

    #[test]
    fn test_try_begin_rejects_overlapping_turns() {
        let ctx = ConversationContext::new(None);
        ctx.try_begin(TurnPhase::AwaitingCompletion).unwrap();
        let err = ctx.try_begin(TurnPhase::ResolvingAction).unwrap_err();
        assert!(matches!(err, DispatchError::TurnInProgress(_)));

        ctx.set_phase(TurnPhase::Idle);
        assert!(ctx.try_begin(TurnPhase::ResolvingAction).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_idle_resolves_on_transition() {
        let ctx = ConversationContext::new(None);
        ctx.try_begin(TurnPhase::AwaitingCompletion).unwrap();

        let other = ctx.clone();
        let waiter = tokio::spawn(async move { other.wait_for_idle().await });
        tokio::task::yield_now().await;
        ctx.set_phase(TurnPhase::Streaming);
        ctx.set_phase(TurnPhase::Idle);

        waiter.await.unwrap();
        assert_eq!(ctx.phase(), TurnPhase::Idle);
    }
}
