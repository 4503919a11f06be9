use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(600);

pub const CONCURRENT_SESSIONS_WARNING: &str = "Other sessions are also connected to the bridge. \
If they target this document, changes apply immediately (last-write-wins).";

struct CallerSession {
    last_seen: Instant,
    warned: HashSet<String>,
}

/// Caller sessions that have sent commands recently, and which documents each
/// one has already been warned about.
///
/// Nothing is serialized between callers; the tracker only lets a caller know
/// that its edits may interleave with someone else's.
#[derive(Clone)]
pub struct SessionTracker {
    idle_after: Duration,
    sessions: Arc<Mutex<HashMap<String, CallerSession>>>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_IDLE)
    }
}

impl SessionTracker {
    /// A zero `idle_after` keeps sessions until they are ended explicitly.
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CallerSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|err| err.into_inner());
        if !self.idle_after.is_zero() {
            let now = Instant::now();
            let idle_after = self.idle_after;
            sessions.retain(|session_id, session| {
                let keep = now.duration_since(session.last_seen) <= idle_after;
                if !keep {
                    debug!(event = "session_idle", session_id = %session_id);
                }
                keep
            });
        }
        sessions
    }

    /// Marks `session_id` active. Empty ids are ignored.
    pub fn touch(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(session) => session.last_seen = Instant::now(),
            None => {
                sessions.insert(
                    session_id.to_string(),
                    CallerSession {
                        last_seen: Instant::now(),
                        warned: HashSet::new(),
                    },
                );
                info!(
                    event = "session_active",
                    session_id = session_id,
                    active = sessions.len()
                );
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns the concurrency warning the first time `session_id` touches
    /// `document_id` while another session is active. Anonymous callers never
    /// get one.
    pub fn concurrent_warning(
        &self,
        session_id: Option<&str>,
        document_id: &str,
    ) -> Option<&'static str> {
        let session_id = session_id.filter(|value| !value.is_empty())?;
        let mut sessions = self.lock();
        if sessions.len() <= 1 {
            return None;
        }
        let session = sessions.get_mut(session_id)?;
        if !session.warned.insert(document_id.to_string()) {
            return None;
        }
        debug!(
            event = "session_concurrent_warning",
            session_id = session_id,
            document_id = document_id
        );
        Some(CONCURRENT_SESSIONS_WARNING)
    }

    /// Forgets a session and the warnings it was given.
    pub fn end(&self, session_id: &str) -> bool {
        let removed = self.lock().remove(session_id).is_some();
        if removed {
            info!(event = "session_ended", session_id = session_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_session_is_never_warned() {
        let tracker = SessionTracker::default();
        tracker.touch("agent-a");
        assert_eq!(tracker.concurrent_warning(Some("agent-a"), "a.pptx"), None);
        assert_eq!(tracker.concurrent_warning(Some("agent-a"), "a.pptx"), None);
    }

    #[test]
    fn warning_is_given_once_per_session_and_document() {
        let tracker = SessionTracker::default();
        tracker.touch("agent-a");
        tracker.touch("agent-b");

        assert_eq!(
            tracker.concurrent_warning(Some("agent-a"), "a.pptx"),
            Some(CONCURRENT_SESSIONS_WARNING)
        );
        assert_eq!(tracker.concurrent_warning(Some("agent-a"), "a.pptx"), None);
        assert_eq!(
            tracker.concurrent_warning(Some("agent-a"), "b.pptx"),
            Some(CONCURRENT_SESSIONS_WARNING)
        );
        assert_eq!(
            tracker.concurrent_warning(Some("agent-b"), "a.pptx"),
            Some(CONCURRENT_SESSIONS_WARNING)
        );
    }

    #[test]
    fn anonymous_callers_are_not_tracked() {
        let tracker = SessionTracker::default();
        tracker.touch("");
        tracker.touch("agent-a");
        tracker.touch("agent-b");
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(tracker.concurrent_warning(None, "a.pptx"), None);
        assert_eq!(tracker.concurrent_warning(Some(""), "a.pptx"), None);
    }

    #[test]
    fn ending_a_session_resets_its_warnings() {
        let tracker = SessionTracker::default();
        tracker.touch("agent-a");
        tracker.touch("agent-b");
        assert!(tracker.concurrent_warning(Some("agent-a"), "a.pptx").is_some());

        assert!(tracker.end("agent-b"));
        assert!(!tracker.end("agent-b"));
        assert_eq!(tracker.active_count(), 1);

        tracker.touch("agent-b");
        assert!(tracker.concurrent_warning(Some("agent-b"), "a.pptx").is_some());
        assert!(tracker.end("agent-a"));
        tracker.touch("agent-a");
        assert!(tracker.concurrent_warning(Some("agent-a"), "a.pptx").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_stop_counting() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        tracker.touch("agent-a");
        tracker.touch("agent-b");
        assert_eq!(tracker.active_count(), 2);

        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.touch("agent-a");
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.concurrent_warning(Some("agent-a"), "a.pptx"), None);
    }
}
