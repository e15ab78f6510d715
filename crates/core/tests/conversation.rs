use async_trait::async_trait;
use parley_core::error::{CompletionError, PersistenceError};
use parley_core::llm_client::MockLLMClient;
use parley_core::registry::{FunctionKind, render_function_result};
use parley_core::streamable::StreamStatus;
use parley_core::ui::{Card, PurchaseStatus, UiNode};
use parley_core::{
    Action, ActionDispatcher, ActionResponse, ChatRecord, ChatStore, ConversationContext,
    DisplayHandle, Identity, MemoryChatStore, Role, SessionGateway, project,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Forwards every write to a channel so tests can count them.
struct RecordingStore {
    writes: mpsc::UnboundedSender<ChatRecord>,
}

impl RecordingStore {
    fn new() -> (Self, mpsc::UnboundedReceiver<ChatRecord>) {
        let (writes, rx) = mpsc::unbounded_channel();
        (Self { writes }, rx)
    }
}

#[async_trait]
impl ChatStore for RecordingStore {
    async fn put(&self, record: ChatRecord) -> Result<(), PersistenceError> {
        self.writes
            .send(record)
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))
    }

    async fn get(&self, _: &str, _: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        Ok(None)
    }

    async fn list(&self, _: &str) -> Result<Vec<ChatRecord>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn get_shared(&self, _: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        Ok(None)
    }
}

/// Fails the first write only.
struct FailFirstWrite {
    inner: Arc<MemoryChatStore>,
    failed: AtomicBool,
}

#[async_trait]
impl ChatStore for FailFirstWrite {
    async fn put(&self, record: ChatRecord) -> Result<(), PersistenceError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("connection refused".to_string()));
        }
        self.inner.put(record).await
    }

    async fn get(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        self.inner.get(user_id, chat_id).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatRecord>, PersistenceError> {
        self.inner.list(user_id).await
    }

    async fn get_shared(&self, chat_id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        self.inner.get_shared(chat_id).await
    }
}

fn dispatcher(client: MockLLMClient, store: Arc<dyn ChatStore>) -> ActionDispatcher {
    ActionDispatcher::new(
        Arc::new(client),
        SessionGateway::new(store),
        "You are a stock trading assistant.",
    )
    .with_purchase_step(Duration::from_millis(1000))
}

fn live(display: &DisplayHandle) -> &parley_core::streamable::StreamableReader<UiNode> {
    match display {
        DisplayHandle::Live(reader) => reader,
        DisplayHandle::Static(_) => panic!("expected a live display"),
    }
}

/// Yields until the detached persistence task has stored `messages` messages.
async fn persisted(store: &MemoryChatStore, owner: &Identity, messages: usize) -> Vec<ChatRecord> {
    for _ in 0..100 {
        let chats = store.list(&owner.user_id).await.unwrap();
        if chats.first().is_some_and(|c| c.messages.len() == messages) {
            return chats;
        }
        tokio::task::yield_now().await;
    }
    panic!("chat with {messages} messages was never persisted");
}

#[tokio::test]
async fn hello_turn_commits_user_and_assistant() {
    let dispatcher = dispatcher(
        MockLLMClient::new(["Hi", " there"]),
        Arc::new(MemoryChatStore::new()),
    );
    let ctx = ConversationContext::new(None);

    let response = dispatcher
        .dispatch(
            &ctx,
            Action::SubmitUserMessage {
                content: "hello".to_string(),
            },
        )
        .unwrap();
    let ActionResponse::Message(result) = response else {
        panic!("expected a message response");
    };
    ctx.wait_for_idle().await;

    let log = ctx.snapshot();
    assert_eq!(log.len(), 2);
    assert_eq!((log[0].role, log[0].content.as_str()), (Role::User, "hello"));
    assert_eq!(
        (log[1].role, log[1].content.as_str()),
        (Role::Assistant, "Hi there")
    );

    let reader = live(&result.display);
    assert_eq!(reader.status(), StreamStatus::Done);
    assert_eq!(reader.current(), UiNode::bot("Hi there"));

    let entries = project(&ctx.model_state());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].display.current(), UiNode::bot("Hi there"));
}

#[tokio::test]
async fn mid_stream_failure_seals_the_handle() {
    let client = MockLLMClient::new(["Hi", " there"])
        .failing_after(1, CompletionError::Network("connection reset".to_string()));
    let dispatcher = dispatcher(client, Arc::new(MemoryChatStore::new()));
    let ctx = ConversationContext::new(Some(Identity::new("u1")));

    let result = dispatcher
        .submit_user_message(&ctx, "hello".to_string())
        .unwrap();
    ctx.wait_for_idle().await;

    let reader = live(&result.display);
    assert_eq!(reader.status(), StreamStatus::Done);
    assert!(matches!(reader.current(), UiNode::Error { .. }));
    assert_eq!(reader.history()[1], UiNode::bot("Hi"));

    let log = ctx.snapshot();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].role, Role::User);
}

#[tokio::test(start_paused = true)]
async fn purchase_returns_before_the_log_changes() {
    let dispatcher = dispatcher(
        MockLLMClient::new(Vec::<String>::new()),
        Arc::new(MemoryChatStore::new()),
    );
    let ctx = ConversationContext::new(None);

    let outcome = dispatcher
        .confirm_purchase(&ctx, "ACME".to_string(), 10.0, 5)
        .unwrap();
    assert!(!outcome.purchasing_ui.display.is_done());
    assert!(ctx.snapshot().is_empty());

    ctx.wait_for_idle().await;

    let log = ctx.snapshot();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::Function);
    assert_eq!(log[0].name.as_deref(), Some("showStockPurchase"));
    assert_eq!(
        log[0].content,
        r#"{"symbol":"ACME","price":10,"defaultAmount":5,"status":"completed"}"#
    );
    assert_eq!(log[1].role, Role::System);
    assert!(log[1].content.contains("purchased 5 shares of ACME"));

    assert!(outcome.purchasing_ui.display.is_done());
    assert!(outcome.new_message.display.is_done());
}

#[tokio::test]
async fn unauthenticated_turn_is_never_written() {
    let (store, mut writes) = RecordingStore::new();
    let dispatcher = dispatcher(MockLLMClient::new(["Hi"]), Arc::new(store));
    let ctx = ConversationContext::new(None);

    dispatcher
        .submit_user_message(&ctx, "hello".to_string())
        .unwrap();
    ctx.wait_for_idle().await;
    tokio::task::yield_now().await;

    assert_eq!(ctx.snapshot().len(), 2);
    assert!(writes.try_recv().is_err());
}

#[tokio::test]
async fn authenticated_turn_is_written_once() {
    let (store, mut writes) = RecordingStore::new();
    let dispatcher = dispatcher(MockLLMClient::new(["Hi"]), Arc::new(store));
    let ctx = ConversationContext::new(Some(Identity::new("u1")));

    dispatcher
        .submit_user_message(&ctx, "hello".to_string())
        .unwrap();
    ctx.wait_for_idle().await;

    let record = writes.recv().await.unwrap();
    assert_eq!(record.id, ctx.conversation_id());
    assert_eq!(record.user_id, "u1");
    assert_eq!(record.title, "hello");
    assert_eq!(record.messages.len(), 2);

    let extra = tokio::time::timeout(Duration::from_millis(50), writes.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn repeated_turns_overwrite_one_record_and_replay() {
    let store = Arc::new(MemoryChatStore::new());
    let dispatcher = dispatcher(MockLLMClient::new(["Hi"]), store.clone());
    let owner = Identity::new("u1");
    let ctx = ConversationContext::new(Some(owner.clone()));

    for content in ["hello", "again"] {
        dispatcher
            .submit_user_message(&ctx, content.to_string())
            .unwrap();
        ctx.wait_for_idle().await;
    }

    let chats = persisted(&store, &owner, 4).await;
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].messages.len(), 4);
    assert_eq!(store.len().await, 1);

    let resumed = ConversationContext::resume(chats[0].model_state(), Some(owner)).unwrap();
    let first = project(&resumed.model_state());
    let second = project(&chats[0].model_state());
    assert_eq!(first.len(), 4);
    let ids: Vec<_> = first.iter().map(|e| e.id.clone()).collect();
    let again: Vec<_> = second.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, again);
    assert_eq!(ids[0], format!("{}-0", ctx.conversation_id()));
}

#[tokio::test(start_paused = true)]
async fn retried_write_never_rolls_back_a_newer_turn() {
    let store = Arc::new(MemoryChatStore::new());
    let flaky = FailFirstWrite {
        inner: store.clone(),
        failed: AtomicBool::new(false),
    };
    let dispatcher = dispatcher(MockLLMClient::new(["Hi"]), Arc::new(flaky));
    let owner = Identity::new("u1");
    let ctx = ConversationContext::new(Some(owner.clone()));

    for content in ["hello", "again"] {
        dispatcher
            .submit_user_message(&ctx, content.to_string())
            .unwrap();
        ctx.wait_for_idle().await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(ctx.snapshot().len(), 4);
    let chats = store.list(&owner.user_id).await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].messages.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn every_function_the_dispatcher_writes_is_registered() {
    let dispatcher = dispatcher(
        MockLLMClient::new(Vec::<String>::new()),
        Arc::new(MemoryChatStore::new()),
    );
    let ctx = ConversationContext::new(None);

    dispatcher
        .confirm_purchase(&ctx, "ACME".to_string(), 10.0, 5)
        .unwrap();
    ctx.wait_for_idle().await;

    let functions: Vec<_> = ctx
        .snapshot()
        .into_iter()
        .filter(|m| m.role == Role::Function)
        .collect();
    assert!(!functions.is_empty());
    for message in functions {
        let name = message.name.as_deref();
        assert!(name.and_then(FunctionKind::from_name).is_some());
        match render_function_result(name, &message.content) {
            UiNode::BotCard {
                card: Card::Purchase(card),
            } => assert_eq!(card.status, PurchaseStatus::Completed),
            other => panic!("unexpected display {other:?}"),
        }
    }

    let entries = project(&ctx.model_state());
    assert_eq!(entries.len(), 1);
}
