//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the chat store and the action dispatcher.

use crate::route_guard::GuardConfig;
use parley_core::{ActionDispatcher, ChatStore, SessionGateway, llm_client::LLMClient};
use std::sync::Arc;
use std::time::Duration;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: SessionGateway,
    pub dispatcher: ActionDispatcher,
    pub guard: Arc<GuardConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChatStore>,
        llm_client: Arc<dyn LLMClient>,
        system_prompt: impl Into<Arc<str>>,
        purchase_step: Duration,
    ) -> Self {
        let gateway = SessionGateway::new(store);
        let dispatcher = ActionDispatcher::new(llm_client, gateway.clone(), system_prompt)
            .with_purchase_step(purchase_step);
        Self {
            gateway,
            dispatcher,
            guard: Arc::new(GuardConfig::default()),
        }
    }
}
