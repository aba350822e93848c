//! Per-session serialization: one running turn per session.
//!
//! The engine gives each task a single logical thread of control; the
//! gateway enforces that at the session boundary by rejecting a second
//! concurrent request for the same session with 429.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
pub struct SessionBusy;

#[derive(Default)]
pub struct SessionLockMap {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Held for the duration of a turn; releases the session on drop.
pub struct SessionPermit {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.active.lock().remove(&self.session_id);
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, session_id: &str) -> Result<SessionPermit, SessionBusy> {
        let mut active = self.active.lock();
        if !active.insert(session_id.to_owned()) {
            return Err(SessionBusy);
        }
        Ok(SessionPermit {
            active: self.active.clone(),
            session_id: session_id.to_owned(),
        })
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.active.lock().contains(session_id)
    }
}
