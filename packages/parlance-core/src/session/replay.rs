//! Replay session storage.
//!
//! An upload handler binds a file to a freshly minted session id; the replay
//! socket later redeems that id exactly once. Bindings expire if never
//! consumed so abandoned uploads don't accumulate.

use std::path::PathBuf;

use dashmap::DashMap;

use crate::protocol_constants::REPLAY_SESSION_TTL_MS;
use crate::utils::now_millis_u64;

/// A pending replay binding: uploaded file plus the providers to fan out to.
#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub session_id: String,
    pub providers: Vec<String>,
    pub lang: String,
    pub file_path: PathBuf,
    /// Expiry (ms since epoch); unconsumed bindings vanish after this.
    pub expires_at: u64,
}

/// Take-once store of replay bindings.
pub struct ReplaySessionStore {
    sessions: DashMap<String, ReplaySession>,
    ttl_ms: u64,
}

impl Default for ReplaySessionStore {
    fn default() -> Self {
        Self::new(REPLAY_SESSION_TTL_MS)
    }
}

impl ReplaySessionStore {
    /// Creates a store whose bindings live `ttl_ms` before expiring.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_ms,
        }
    }

    /// Binds a file to a new session id, returning the id.
    pub fn insert(&self, providers: Vec<String>, lang: String, file_path: PathBuf) -> String {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let session = ReplaySession {
            session_id: session_id.clone(),
            providers,
            lang,
            file_path,
            expires_at: now_millis_u64() + self.ttl_ms,
        };
        self.sessions.insert(session_id.clone(), session);
        session_id
    }

    /// Consumes a binding. The first take wins; later calls (and takes of
    /// expired bindings) return `None`.
    pub fn take(&self, session_id: &str) -> Option<ReplaySession> {
        let (_, session) = self.sessions.remove(session_id)?;
        if session.expires_at < now_millis_u64() {
            return None;
        }
        Some(session)
    }

    /// Removes expired bindings, returning their file paths for cleanup.
    pub fn sweep_expired(&self) -> Vec<PathBuf> {
        let now = now_millis_u64();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|r| r.value().expires_at < now)
            .map(|r| r.key().clone())
            .collect();

        let mut paths = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some((_, session)) = self.sessions.remove(&id) {
                paths.push(session.file_path);
            }
        }
        paths
    }

    /// Number of pending bindings.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_exactly_once() {
        let store = ReplaySessionStore::default();
        let id = store.insert(
            vec!["mock".into()],
            "en".into(),
            PathBuf::from("/tmp/a.wav"),
        );

        let first = store.take(&id);
        assert!(first.is_some());
        assert_eq!(first.unwrap().providers, vec!["mock".to_string()]);

        assert!(store.take(&id).is_none());
    }

    #[test]
    fn unknown_id_returns_none() {
        let store = ReplaySessionStore::default();
        assert!(store.take("nope").is_none());
    }

    #[test]
    fn expired_binding_is_not_taken() {
        let store = ReplaySessionStore::new(0);
        let id = store.insert(vec!["mock".into()], "en".into(), PathBuf::from("/tmp/a.wav"));
        // ttl of 0 ms: already expired.
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(store.take(&id).is_none());
    }

    #[test]
    fn sweep_returns_expired_file_paths() {
        let store = ReplaySessionStore::new(0);
        store.insert(vec!["mock".into()], "en".into(), PathBuf::from("/tmp/a.wav"));
        store.insert(vec!["mock".into()], "en".into(), PathBuf::from("/tmp/b.wav"));
        std::thread::sleep(std::time::Duration::from_millis(2));

        let mut paths = store.sweep_expired();
        paths.sort();
        assert_eq!(
            paths,
            vec![PathBuf::from("/tmp/a.wav"), PathBuf::from("/tmp/b.wav")]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn ids_are_distinct() {
        let store = ReplaySessionStore::default();
        let a = store.insert(vec![], "en".into(), PathBuf::from("/tmp/a"));
        let b = store.insert(vec![], "en".into(), PathBuf::from("/tmp/b"));
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }
}
