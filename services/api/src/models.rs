//! API Models
//!
//! Response and payload types of the REST surface, documented for OpenAPI with
//! `utoipa`. Transcript messages and presentation entries are produced by the core
//! crate and exposed here as free-form objects.

use chrono::{DateTime, Utc};
use parley_core::{ChatRecord, EntrySnapshot, Message, project};
use serde::Serialize;
use utoipa::ToSchema;

/// A chat as it appears in the owner's chat list.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ChatSummary {
    #[schema(example = "Xc3mZk2v9QbT1pLa")]
    pub id: String,
    #[schema(example = "What is the price of ACME?")]
    pub title: String,
    #[schema(example = "/chat/Xc3mZk2v9QbT1pLa")]
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub share_path: Option<String>,
}

impl From<&ChatRecord> for ChatSummary {
    fn from(record: &ChatRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            path: record.path.clone(),
            created_at: record.created_at,
            share_path: record.share_path.clone(),
        }
    }
}

/// A full chat: its transcript and the presentation state replayed from it.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub summary: ChatSummary,
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<Message>,
    #[schema(value_type = Vec<Object>)]
    pub ui_state: Vec<EntrySnapshot>,
}

impl From<ChatRecord> for ChatResponse {
    fn from(record: ChatRecord) -> Self {
        let ui_state = project(&record.model_state())
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        Self {
            summary: ChatSummary::from(&record),
            messages: record.messages,
            ui_state,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ShareResponse {
    pub id: String,
    #[schema(example = "/share/Xc3mZk2v9QbT1pLa")]
    pub share_path: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
