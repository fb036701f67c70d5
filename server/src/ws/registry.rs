//! Directory of live session coordinators.
//!
//! Guarantees at most one live [`SessionServer`] per session identifier
//! process-wide: all connections for one identifier resolve to the same
//! coordinator, created on first use. Identifiers are matched by the literal,
//! case-preserved token, so two differently-cased identifiers address two
//! different sessions.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dicebox_session::{models::SessionId, SessionDb, SessionDbError};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::ws::server::{SessionServer, SessionServerHandle};

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<String, SessionServerHandle>>>,
    db: SessionDb,
    config: Config,
}

impl SessionRegistry {
    pub fn new(db: SessionDb, config: Config) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            db,
            config,
        }
    }

    #[must_use]
    pub const fn client_timeout(&self) -> Duration {
        self.config.client_timeout
    }

    /// Resolve the coordinator for `session_id`, spawning it on first use.
    ///
    /// A handle whose coordinator has already exited (evicted after
    /// inactivity) is replaced with a fresh instance, which rehydrates from
    /// the record store.
    ///
    /// # Errors
    ///
    /// * If a fresh coordinator fails to rehydrate from the record store
    pub async fn get_or_create(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionServerHandle, SessionDbError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(session_id.as_str()) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut sessions = self.sessions.write().await;

        // double-check under the write lock: another caller may have created
        // the coordinator, or an evicted instance may still occupy the slot
        if let Some(handle) = sessions.get(session_id.as_str()) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let (server, handle) = SessionServer::new(
            session_id.clone(),
            self.db.clone(),
            self.config.eviction_timeout,
        )
        .await?;

        let session_key = session_id.as_str().to_owned();
        let registry_sessions = Arc::clone(&self.sessions);
        tokio::task::spawn({
            let session_key = session_key.clone();
            async move {
                if let Err(error) = server.run().await {
                    log::error!("Session {session_key} coordinator failed: {error:?}");
                }

                // drop the registry entry unless a replacement already took
                // the slot
                let mut sessions = registry_sessions.write().await;
                if sessions
                    .get(&session_key)
                    .is_some_and(SessionServerHandle::is_closed)
                {
                    sessions.remove(&session_key);
                }
            }
        });

        sessions.insert(session_key, handle.clone());

        Ok(handle)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every live coordinator.
    pub async fn shutdown(&self) {
        for handle in self.sessions.read().await.values() {
            handle.shutdown();
        }
    }
}
