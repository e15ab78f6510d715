use crate::error::CompletionError;
use crate::message::Role;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

/// A stream of raw text deltas from the LLM.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// A message as it is presented to the model, stripped of log metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
}

/// A generic client for interacting with an LLM.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Starts a streaming chat completion and returns the text deltas as they arrive.
    async fn stream_chat(
        &self,
        system_prompt: &str,
        messages: Vec<PromptMessage>,
    ) -> Result<DeltaStream, CompletionError>;

    /// The model identifier requests are issued against.
    fn model(&self) -> &str;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-3.5-turbo").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

fn to_request_message(message: PromptMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let request = match message.role {
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
        Role::System | Role::Data => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content)
            .build()?
            .into(),
        // Function results have no call id to pair with, so they reach the model as context.
        Role::Function | Role::Tool => ChatCompletionRequestSystemMessageArgs::default()
            .content(format!(
                "[{} result] {}",
                message.name.as_deref().unwrap_or("function"),
                message.content
            ))
            .build()?
            .into(),
    };
    Ok(request)
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_chat(
        &self,
        system_prompt: &str,
        messages: Vec<PromptMessage>,
    ) -> Result<DeltaStream, CompletionError> {
        let mut request_messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(messages.len() + 1);
        request_messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt.to_string())
                .build()?
                .into(),
        );
        for message in messages {
            request_messages.push(to_request_message(message)?);
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(request_messages)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .filter(|content| !content.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(CompletionError::from(e))),
            }
        })))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

enum Script {
    Deltas {
        deltas: Vec<String>,
        failure: Option<(usize, CompletionError)>,
    },
    Unavailable(CompletionError),
}

/// A scripted `LLMClient` for development and integration testing.
///
/// It replays a fixed list of deltas for every request and records the prompts it
/// was given, which makes turns deterministic without network access.
pub struct MockLLMClient {
    script: Script,
    requests: Mutex<Vec<Vec<PromptMessage>>>,
}

impl MockLLMClient {
    pub fn new<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Deltas {
                deltas: deltas.into_iter().map(Into::into).collect(),
                failure: None,
            },
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A client whose stream fails with `error` after emitting `after` deltas.
    pub fn failing_after(mut self, after: usize, error: CompletionError) -> Self {
        if let Script::Deltas { failure, .. } = &mut self.script {
            *failure = Some((after, error));
        }
        self
    }

    /// A client that cannot start a completion at all.
    pub fn unavailable(error: CompletionError) -> Self {
        Self {
            script: Script::Unavailable(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The prompt messages of every request received so far.
    pub fn requests(&self) -> Vec<Vec<PromptMessage>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn stream_chat(
        &self,
        _system_prompt: &str,
        messages: Vec<PromptMessage>,
    ) -> Result<DeltaStream, CompletionError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages);

        match &self.script {
            Script::Unavailable(error) => Err(error.clone()),
            Script::Deltas { deltas, failure } => {
                let mut items: Vec<Result<String, CompletionError>> = match failure {
                    Some((after, _)) => deltas.iter().take(*after).cloned().map(Ok).collect(),
                    None => deltas.iter().cloned().map(Ok).collect(),
                };
                if let Some((_, error)) = failure {
                    items.push(Err(error.clone()));
                }
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    fn model(&self) -> &str {
        "mock"
    }
}
