//! Write-once-then-sealed values that renderers observe while they are still changing.
//!
//! A [`Streamable`] is owned by exactly one producer. It accepts any number of
//! [`Streamable::update`] calls and is sealed by [`Streamable::done`], which consumes
//! the handle, so no update can follow a seal and a handle is sealed at most once.
//! Any number of [`StreamableReader`]s observe the same value. A producer that is
//! dropped without sealing marks the value as abandoned so that readers never wait
//! forever.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Open,
    Done,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamableError {
    #[error("streamable value was dropped before it was sealed")]
    Abandoned,
}

/// One observed value together with whether it is the sealed, final one.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate<T> {
    pub value: T,
    pub is_final: bool,
}

/// Point-in-time view of a streamable value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot<T> {
    pub value: T,
    pub status: StreamStatus,
}

struct State<T> {
    latest: T,
    /// Values not yet consumed by every reader; `history[0]` has sequence number `base`.
    history: VecDeque<T>,
    base: usize,
    cursors: HashMap<u64, usize>,
    next_reader: u64,
    status: StreamStatus,
}

impl<T> State<T> {
    fn end(&self) -> usize {
        self.base + self.history.len()
    }

    fn register(&mut self, cursor: usize) -> u64 {
        let id = self.next_reader;
        self.next_reader += 1;
        self.cursors.insert(id, cursor);
        id
    }

    /// Drops every value all readers have consumed, always keeping the latest one so a
    /// reader created later still observes the current value.
    fn prune(&mut self) {
        let keep_from = self
            .cursors
            .values()
            .copied()
            .min()
            .unwrap_or(usize::MAX)
            .min(self.end().saturating_sub(1));
        while self.base < keep_from && self.history.pop_front().is_some() {
            self.base += 1;
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    version: watch::Sender<u64>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// The producer side of a streamable value.
pub struct Streamable<T> {
    shared: Arc<Shared<T>>,
    sealed: bool,
}

impl<T: Clone> Streamable<T> {
    pub fn new(initial: T) -> Self {
        let (version, _) = watch::channel(0);
        let state = State {
            latest: initial.clone(),
            history: VecDeque::from([initial]),
            base: 0,
            cursors: HashMap::new(),
            next_reader: 0,
            status: StreamStatus::Open,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                version,
            }),
            sealed: false,
        }
    }

    /// A reader that starts at the oldest value still retained.
    pub fn reader(&self) -> StreamableReader<T> {
        let mut state = self.shared.lock();
        let cursor = state.base;
        let id = state.register(cursor);
        StreamableReader {
            shared: Arc::clone(&self.shared),
            id,
            cursor,
        }
    }

    pub fn update(&mut self, value: T) {
        self.push(value, StreamStatus::Open);
    }

    /// Publishes the final value and seals the handle.
    pub fn done(mut self, value: T) {
        self.push(value, StreamStatus::Done);
        self.sealed = true;
    }

    fn push(&self, value: T, status: StreamStatus) {
        {
            let mut state = self.shared.lock();
            state.history.push_back(value.clone());
            state.latest = value;
            state.status = status;
            state.prune();
        }
        self.shared.notify();
    }
}

impl<T> Drop for Streamable<T> {
    fn drop(&mut self) {
        if self.sealed {
            return;
        }
        self.shared.lock().status = StreamStatus::Abandoned;
        self.shared.notify();
        warn!("Streamable value dropped without being sealed");
    }
}

/// The consumer side of a streamable value.
///
/// Each reader keeps its own cursor, so [`StreamableReader::next`] yields every update
/// in emission order regardless of how fast the producer runs. Values are retained
/// only until every live reader has consumed them.
pub struct StreamableReader<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    cursor: usize,
}

impl<T> Clone for StreamableReader<T> {
    fn clone(&self) -> Self {
        let id = self.shared.lock().register(self.cursor);
        Self {
            shared: Arc::clone(&self.shared),
            id,
            cursor: self.cursor,
        }
    }
}

impl<T> Drop for StreamableReader<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.cursors.remove(&self.id);
        state.prune();
    }
}

impl<T> std::fmt::Debug for StreamableReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableReader")
            .field("status", &self.status())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<T> StreamableReader<T> {
    pub fn status(&self) -> StreamStatus {
        self.shared.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status() == StreamStatus::Done
    }

    /// Whether the value reached a terminal state, sealed or abandoned.
    pub fn is_terminal(&self) -> bool {
        self.status() != StreamStatus::Open
    }

    /// Number of values currently retained for readers.
    pub fn retained(&self) -> usize {
        self.shared.lock().history.len()
    }
}

impl<T: Clone> StreamableReader<T> {
    /// The latest published value.
    pub fn current(&self) -> T {
        self.shared.lock().latest.clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        let state = self.shared.lock();
        Snapshot {
            value: state.latest.clone(),
            status: state.status,
        }
    }

    /// The values still retained, oldest first.
    ///
    /// While this reader has consumed nothing, that is every value published so far.
    pub fn history(&self) -> Vec<T> {
        self.shared.lock().history.iter().cloned().collect()
    }

    /// Waits for the next value this reader has not seen yet.
    ///
    /// Returns `None` once every value was consumed and the producer sealed or
    /// abandoned the handle.
    pub async fn next(&mut self) -> Option<StreamUpdate<T>> {
        let mut version = self.shared.version.subscribe();
        loop {
            let _ = version.borrow_and_update();
            {
                let mut state = self.shared.lock();
                self.cursor = self.cursor.max(state.base);
                if self.cursor < state.end() {
                    let value = state.history[self.cursor - state.base].clone();
                    self.cursor += 1;
                    let is_final = state.status == StreamStatus::Done && self.cursor == state.end();
                    state.cursors.insert(self.id, self.cursor);
                    state.prune();
                    return Some(StreamUpdate { value, is_final });
                }
                if state.status != StreamStatus::Open {
                    return None;
                }
            }
            if version.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Waits until the producer seals the value and returns it.
    pub async fn wait(&self) -> Result<T, StreamableError> {
        let mut version = self.shared.version.subscribe();
        loop {
            let _ = version.borrow_and_update();
            {
                let state = self.shared.lock();
                match state.status {
                    StreamStatus::Done => return Ok(state.latest.clone()),
                    StreamStatus::Abandoned => return Err(StreamableError::Abandoned),
                    StreamStatus::Open => {}
                }
            }
            if version.changed().await.is_err() {
                return Err(StreamableError::Abandoned);
            }
        }
    }
}
