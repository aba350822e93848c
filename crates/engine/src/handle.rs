//! Run control: cancellation tokens with group fan-out and the
//! caller-facing query handle.
//!
//! Each run gets a `CancelToken` checked at the start of every phase and
//! after every suspension point. Groups support cascading cancellation:
//! cancelling a parent run also cancels the sub-agent runs registered in
//! its group.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Active cancel tokens per session, with parent→children groups.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel a run and every child in its group. Returns whether a
    /// token was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(session_id) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(session_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }
        found
    }

    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
        self.groups.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

/// Control surface handed back by `Engine::run`.
#[derive(Clone)]
pub struct QueryHandle {
    session_id: String,
    token: CancelToken,
    running: Arc<AtomicBool>,
    model: Arc<RwLock<Option<String>>>,
}

impl QueryHandle {
    pub fn new(session_id: String, token: CancelToken, model: Option<String>) -> Self {
        Self {
            session_id,
            token,
            running: Arc::new(AtomicBool::new(true)),
            model: Arc::new(RwLock::new(model)),
        }
    }

    pub fn interrupt(&self) {
        self.token.cancel();
    }

    /// Change the model for subsequent iterations of this run.
    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write() = Some(model.into());
    }

    pub fn model(&self) -> Option<String> {
        self.model.read().clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Called by the run loop when it exits.
    pub(crate) fn mark_finished(&self) {
        self.running.store(false, Ordering::Release);
    }
}
