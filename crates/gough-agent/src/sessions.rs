//! Active session accounting.
//!
//! The reverse-SSH server registers sessions as they start and end; the
//! heartbeat loop reads the live count and drains the closed list into its
//! next report. Termination commands look up the close handle by session
//! id.

use std::collections::HashMap;

use gough_core::SessionId;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

struct Inner {
    active: HashMap<SessionId, CancellationToken>,
    closed: Vec<SessionId>,
}

/// Registry of live PTY sessions.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                closed: Vec::new(),
            }),
        }
    }

    /// Register a session start, returning the token that cancels it.
    pub fn start(&self, session_id: SessionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.lock().active.insert(session_id, token.clone());
        tracing::info!(session_id = %session_id, "session started");
        token
    }

    /// Register a session end.
    pub fn end(&self, session_id: &SessionId) {
        let mut inner = self.inner.lock();
        if inner.active.remove(session_id).is_some() {
            inner.closed.push(*session_id);
            tracing::info!(session_id = %session_id, "session ended");
        }
    }

    /// Cancel one session (terminate command). Returns false when the
    /// session is not live.
    pub fn terminate(&self, session_id: &SessionId) -> bool {
        let inner = self.inner.lock();
        if let Some(token) = inner.active.get(session_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every live session (shutdown).
    pub fn terminate_all(&self) {
        for token in self.inner.lock().active.values() {
            token.cancel();
        }
    }

    /// The live session count.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        u32::try_from(self.inner.lock().active.len()).unwrap_or(u32::MAX)
    }

    /// Drain the sessions that ended since the last drain.
    #[must_use]
    pub fn drain_closed(&self) -> Vec<SessionId> {
        std::mem::take(&mut self.inner.lock().closed)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counts() {
        let registry = SessionRegistry::new();
        let a = SessionId::generate();
        let b = SessionId::generate();

        let _ta = registry.start(a);
        let _tb = registry.start(b);
        assert_eq!(registry.active_count(), 2);

        registry.end(&a);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.drain_closed(), vec![a]);
        // Drained once.
        assert!(registry.drain_closed().is_empty());
    }

    #[test]
    fn terminate_cancels_token() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        let token = registry.start(id);

        assert!(!token.is_cancelled());
        assert!(registry.terminate(&id));
        assert!(token.is_cancelled());

        assert!(!registry.terminate(&SessionId::generate()));
    }

    #[test]
    fn ending_unknown_session_is_harmless() {
        let registry = SessionRegistry::new();
        registry.end(&SessionId::generate());
        assert!(registry.drain_closed().is_empty());
    }
}
