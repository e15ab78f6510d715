//! Streaming completion adapter.
//!
//! Turns the raw delta stream of an [`LLMClient`] into a finite sequence of
//! [`CompletionChunk`]s carrying the accumulated content. The last item is either a
//! chunk with `is_done = true`, whose `content_so_far` is the authoritative assistant
//! message, or a [`CompletionError`]. A sequence is consumed once; every turn issues a
//! new call.

use crate::error::CompletionError;
use crate::llm_client::{DeltaStream, LLMClient, PromptMessage};
use crate::message::{Message, Role};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionChunk {
    pub content_so_far: String,
    pub delta: String,
    pub is_done: bool,
}

pub type CompletionStream = BoxStream<'static, Result<CompletionChunk, CompletionError>>;

/// Maps the transcript to prompt messages, dropping roles the model has no use for.
pub fn prompt_messages(prior: &[Message]) -> Vec<PromptMessage> {
    prior
        .iter()
        .filter(|message| message.role != Role::Data)
        .map(|message| PromptMessage {
            role: message.role,
            content: message.content.clone(),
            name: message.name.clone(),
        })
        .collect()
}

/// Issues a streaming completion for the given transcript.
pub async fn complete_streaming(
    client: &dyn LLMClient,
    system_prompt: &str,
    prior: &[Message],
) -> Result<CompletionStream, CompletionError> {
    let prompt = prompt_messages(prior);
    debug!(
        model = client.model(),
        messages = prompt.len(),
        "Starting streaming completion"
    );
    let deltas = client.stream_chat(system_prompt, prompt).await?;
    Ok(accumulate(deltas))
}

struct Accumulator {
    deltas: Option<DeltaStream>,
    content: String,
}

/// Folds raw deltas into chunks and appends the terminal `is_done` chunk.
pub fn accumulate(deltas: DeltaStream) -> CompletionStream {
    let initial = Accumulator {
        deltas: Some(deltas),
        content: String::new(),
    };

    stream::unfold(initial, |mut acc| async move {
        let next = acc.deltas.as_mut()?.next().await;
        match next {
            Some(Ok(delta)) => {
                acc.content.push_str(&delta);
                let chunk = CompletionChunk {
                    content_so_far: acc.content.clone(),
                    delta,
                    is_done: false,
                };
                Some((Ok(chunk), acc))
            }
            Some(Err(e)) => {
                acc.deltas = None;
                Some((Err(e), acc))
            }
            None => {
                acc.deltas = None;
                let chunk = CompletionChunk {
                    content_so_far: acc.content.clone(),
                    delta: String::new(),
                    is_done: true,
                };
                Some((Ok(chunk), acc))
            }
        }
    })
    .boxed()
}
