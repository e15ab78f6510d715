//! Append-only turn message log.

use crate::error::ConsistencyError;
use crate::message::Message;
use std::collections::HashSet;

/// The canonical, ordered record of a conversation.
///
/// Messages are only ever appended; the single exception is [`MessageLog::replace_tail`],
/// which splices finalized results in place of provisional trailing entries.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from a persisted transcript, rejecting duplicate ids.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, ConsistencyError> {
        let mut log = Self::new();
        for message in messages {
            log.append(message)?;
        }
        Ok(log)
    }

    pub fn append(&mut self, message: Message) -> Result<(), ConsistencyError> {
        if !self.ids.insert(message.id.clone()) {
            return Err(ConsistencyError::DuplicateId(message.id));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Removes the last `n` messages and appends `messages` in their place.
    ///
    /// The operation is atomic: on error the log is left untouched.
    pub fn replace_tail(
        &mut self,
        n: usize,
        messages: Vec<Message>,
    ) -> Result<(), ConsistencyError> {
        let len = self.messages.len();
        if n > len {
            return Err(ConsistencyError::TailOutOfRange { requested: n, len });
        }

        let kept = len - n;
        let mut ids: HashSet<String> = self.messages[..kept]
            .iter()
            .map(|m| m.id.clone())
            .collect();
        for message in &messages {
            if !ids.insert(message.id.clone()) {
                return Err(ConsistencyError::DuplicateId(message.id.clone()));
            }
        }

        self.messages.truncate(kept);
        self.messages.extend(messages);
        self.ids = ids;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
