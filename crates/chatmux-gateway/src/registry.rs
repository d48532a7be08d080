//! Session registry.
//!
//! Owns session identity, lifecycle state, worker-assignment bookkeeping,
//! and the at-most-one-turn-in-flight gate. All mutation goes through this
//! type; sessions are persisted on every change.

use crate::error::GatewayError;
use crate::store::{SessionRecord, SessionStore, TranscriptEntry};
use crate::Result;
use chatmux_core::config::SessionConfig;
use chatmux_core::types::{ConversationKey, Session, SessionId, SessionState};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<ConversationKey, SessionId>,
    transcripts: HashMap<SessionId, Vec<TranscriptEntry>>,
}

impl RegistryState {
    fn persist(&self, store: &SessionStore, id: &SessionId) -> Result<()> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        store.save(&SessionRecord {
            session: session.clone(),
            transcript: self.transcripts.get(id).cloned().unwrap_or_default(),
        })
    }
}

/// Registry of all known sessions.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    store: SessionStore,
    config: SessionConfig,
}

impl SessionRegistry {
    /// Open the registry, loading persisted sessions from `data_dir`.
    pub fn open(config: SessionConfig, data_dir: &Path) -> Result<Self> {
        let store = SessionStore::open(data_dir)?;

        let mut sessions = HashMap::new();
        let mut by_key = HashMap::new();
        let mut transcripts = HashMap::new();
        for record in store.load_all()? {
            let id = record.session.id.clone();
            if !record.session.is_closed() {
                by_key.insert(record.session.key.clone(), id.clone());
            }
            transcripts.insert(id.clone(), record.transcript);
            sessions.insert(id, record.session);
        }
        info!("loaded {} persisted sessions", sessions.len());

        Ok(Self {
            state: Mutex::new(RegistryState {
                sessions,
                by_key,
                transcripts,
            }),
            store,
            config,
        })
    }

    /// Open a registry rooted at the configured data directory.
    pub fn open_default(config: SessionConfig) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        Self::open(config, &data_dir)
    }

    /// Return the session for a conversation key, creating one if needed.
    ///
    /// Get-or-create happens under one lock: concurrent resolves for the
    /// same key always yield the same session. A closed session is never
    /// reused; its key maps to a fresh session id. Resolving has no other
    /// side effect; activity counters move when a turn is claimed.
    pub async fn resolve(&self, key: &ConversationKey) -> Result<Session> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.by_key.get(key).cloned() {
            if let Some(session) = state.sessions.get(&id) {
                if !session.is_closed() {
                    return Ok(session.clone());
                }
            }
        }

        let session = Session::new(key.clone());
        let id = session.id.clone();
        debug!(session = %id, key = %key, "created session");
        state.by_key.insert(key.clone(), id.clone());
        state.sessions.insert(id.clone(), session.clone());
        state.transcripts.insert(id.clone(), Vec::new());
        state.persist(&self.store, &id)?;
        Ok(session)
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    /// All known sessions.
    pub async fn list(&self) -> Vec<Session> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// Transcript of a session, oldest turn first.
    pub async fn transcript(&self, id: &SessionId) -> Option<Vec<TranscriptEntry>> {
        self.state.lock().await.transcripts.get(id).cloned()
    }

    /// Claim the turn slot for a session.
    ///
    /// Exactly one concurrent caller wins; the rest fail with `SessionBusy`
    /// until [`SessionRegistry::end_turn`].
    pub async fn begin_turn(&self, id: &SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        if session.is_closed() {
            return Err(GatewayError::SessionNotFound(id.to_string()));
        }
        if session.turn_in_flight {
            return Err(GatewayError::SessionBusy(id.to_string()));
        }
        session.turn_in_flight = true;
        session.touch();
        Ok(())
    }

    /// Release the turn slot.
    pub async fn end_turn(&self, id: &SessionId) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(id) {
            session.turn_in_flight = false;
        }
    }

    /// Record which worker is serving the session's current turn.
    pub async fn assign_worker(&self, id: &SessionId, worker_id: &str) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(id) {
            session.assigned_worker = Some(worker_id.to_string());
        }
    }

    /// Clear the worker assignment.
    pub async fn clear_worker(&self, id: &SessionId) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(id) {
            session.assigned_worker = None;
        }
    }

    /// Append a completed turn to the session's transcript and persist.
    pub async fn append_transcript(&self, id: &SessionId, entry: TranscriptEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .transcripts
            .entry(id.clone())
            .or_default()
            .push(entry);
        state.persist(&self.store, id)
    }

    /// Reset a session: clear worker assignment and history, return to active.
    ///
    /// Fails with `SessionBusy` while a turn is in flight.
    pub async fn reset(&self, id: &SessionId) -> Result<Session> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        if session.turn_in_flight {
            return Err(GatewayError::SessionBusy(id.to_string()));
        }
        session.state = SessionState::Resetting;
        session.assigned_worker = None;
        session.state = SessionState::Active;
        let session = session.clone();
        state.transcripts.insert(id.clone(), Vec::new());
        state.persist(&self.store, id)?;
        info!(session = %id, "session reset");
        Ok(session)
    }

    /// Close a session. Terminal: the conversation key is freed and a new
    /// inbound message for it creates a fresh session.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        session.state = SessionState::Closed;
        let key = session.key.clone();
        if state.by_key.get(&key) == Some(id) {
            state.by_key.remove(&key);
        }
        state.persist(&self.store, id)?;
        info!(session = %id, "session closed");
        Ok(())
    }

    /// Remove a session and its persisted record entirely.
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .remove(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        if state.by_key.get(&session.key) == Some(id) {
            state.by_key.remove(&session.key);
        }
        state.transcripts.remove(id);
        self.store.delete(id)?;
        info!(session = %id, "session deleted");
        Ok(())
    }

    /// Apply inactivity transitions: active sessions go idle after the idle
    /// timeout, and idle sessions are closed after the eviction window.
    /// Sessions with a turn in flight are never touched.
    pub async fn sweep_idle(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let idle_after = chrono::Duration::from_std(self.config.idle_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let evict_after = chrono::Duration::from_std(self.config.evict_after())
            .unwrap_or_else(|_| chrono::Duration::days(1));

        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for (id, session) in state.sessions.iter_mut() {
            if session.turn_in_flight {
                continue;
            }
            let inactive = now - session.last_message_at;
            match session.state {
                SessionState::Active if inactive >= idle_after => {
                    session.state = SessionState::Idle;
                    changed.push(id.clone());
                }
                SessionState::Idle if inactive >= evict_after => {
                    session.state = SessionState::Closed;
                    changed.push(id.clone());
                }
                _ => {}
            }
        }
        for id in &changed {
            if let Some(session) = state.sessions.get(id) {
                if session.is_closed() {
                    let key = session.key.clone();
                    if state.by_key.get(&key) == Some(id) {
                        state.by_key.remove(&key);
                    }
                }
            }
            state.persist(&self.store, id)?;
        }
        if !changed.is_empty() {
            debug!("idle sweep transitioned {} sessions", changed.len());
        }
        Ok(changed.len())
    }

    /// Number of non-closed sessions.
    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| !s.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> SessionRegistry {
        SessionRegistry::open(SessionConfig::default(), dir.path()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_reuses_session_per_key() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let s1 = registry
            .resolve(&ConversationKey::new("telegram", "123"))
            .await
            .unwrap();
        let s1_again = registry
            .resolve(&ConversationKey::new("telegram", "123"))
            .await
            .unwrap();
        let s2 = registry
            .resolve(&ConversationKey::new("telegram", "456"))
            .await
            .unwrap();

        assert_eq!(s1.id, s1_again.id);
        assert_ne!(s1.id, s2.id);
        assert_eq!(s1_again.message_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_single_flight() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(&dir));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .resolve(&ConversationKey::new("web", "same"))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_begin_turn_exactly_one_winner() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(&dir));
        let session = registry
            .resolve(&ConversationKey::new("web", "x"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(
                async move { registry.begin_turn(&id).await },
            ));
        }
        let mut won = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => won += 1,
                Err(GatewayError::SessionBusy(_)) => busy += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(busy, 9);

        // the slot reopens after end_turn
        registry.end_turn(&session.id).await;
        registry.begin_turn(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_key_gets_fresh_session() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let key = ConversationKey::new("telegram", "123");

        let s1 = registry.resolve(&key).await.unwrap();
        registry.close(&s1.id).await.unwrap();

        let s2 = registry.resolve(&key).await.unwrap();
        assert_ne!(s1.id, s2.id);
        assert!(registry.get(&s1.id).await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_reset_clears_transcript_and_worker() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let session = registry
            .resolve(&ConversationKey::new("web", "r"))
            .await
            .unwrap();

        registry.assign_worker(&session.id, "rpc-1").await;
        registry
            .append_transcript(
                &session.id,
                TranscriptEntry::new("hi", "hello", chatmux_core::types::TurnStatus::Completed),
            )
            .await
            .unwrap();

        let reset = registry.reset(&session.id).await.unwrap();
        assert_eq!(reset.state, SessionState::Active);
        assert!(reset.assigned_worker.is_none());
        assert!(registry.transcript(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_refused_mid_turn() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let session = registry
            .resolve(&ConversationKey::new("web", "busy"))
            .await
            .unwrap();

        registry.begin_turn(&session.id).await.unwrap();
        assert!(matches!(
            registry.reset(&session.id).await,
            Err(GatewayError::SessionBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let key = ConversationKey::new("telegram", "persist");
        let id = {
            let registry = registry(&dir);
            registry.resolve(&key).await.unwrap().id
        };

        let reopened = registry(&dir);
        let resolved = reopened.resolve(&key).await.unwrap();
        assert_eq!(resolved.id, id);
    }

    #[tokio::test]
    async fn test_sweep_idles_and_evicts() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            idle_timeout_secs: 0,
            evict_after_secs: 0,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::open(config, dir.path()).unwrap();
        let session = registry
            .resolve(&ConversationKey::new("web", "old"))
            .await
            .unwrap();

        assert_eq!(registry.sweep_idle().await.unwrap(), 1);
        assert_eq!(
            registry.get(&session.id).await.unwrap().state,
            SessionState::Idle
        );
        assert_eq!(registry.sweep_idle().await.unwrap(), 1);
        assert!(registry.get(&session.id).await.unwrap().is_closed());
    }
}
