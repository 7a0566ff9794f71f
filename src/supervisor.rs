//! Out-of-band session launcher.
//!
//! A login trigger must return immediately while the session runs for
//! minutes. The supervisor claims the user's slot and the sensor port on
//! the caller's thread, so conflicts are reported synchronously, then
//! hands the blocking session loop to the runtime's blocking pool.

use crate::core::{SessionError, SessionRecord};
use crate::runner::{CancelFlag, SessionRunner};
use crate::source::SourceFactory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Acknowledgement for an accepted login.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: Uuid,
    pub user_id: String,
    handle: JoinHandle<SessionRecord>,
}

impl SessionTicket {
    /// Wait for the session to finish. Returns `None` if the task panicked.
    pub async fn wait(self) -> Option<SessionRecord> {
        match self.handle.await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "session task failed");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

type ActiveMap = Arc<Mutex<HashMap<String, CancelFlag>>>;

/// Frees a user's slot when the session task ends, however it ends.
struct ActiveSlot {
    user_id: String,
    active: ActiveMap,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.user_id);
    }
}

/// Launches sessions, one per user at a time.
#[derive(Clone)]
pub struct SessionSupervisor {
    runner: Arc<SessionRunner>,
    factory: Arc<dyn SourceFactory>,
    runtime: Handle,
    active: ActiveMap,
}

impl SessionSupervisor {
    pub fn new(runner: Arc<SessionRunner>, factory: Arc<dyn SourceFactory>, runtime: Handle) -> Self {
        Self {
            runner,
            factory,
            runtime,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn runner(&self) -> &Arc<SessionRunner> {
        &self.runner
    }

    /// Start a session for `user_id`.
    ///
    /// Fails with `SessionAlreadyActive` if the user already has one
    /// running, and with the source error if the port cannot be opened.
    pub fn submit(&self, user_id: &str) -> Result<SessionTicket, SessionError> {
        let cancel = CancelFlag::new();
        let slot = self.claim(user_id, cancel.clone())?;

        // Slot drops on error, freeing the user again.
        let mut source = self.factory.open()?;

        let session_id = Uuid::new_v4();
        let runner = self.runner.clone();
        let owner = user_id.to_string();
        let handle = self.runtime.spawn_blocking(move || {
            let _slot = slot;
            runner.run_session(session_id, &owner, &mut source, &cancel)
        });

        tracing::info!(session_id = %session_id, user_id, "session accepted");
        Ok(SessionTicket {
            session_id,
            user_id: user_id.to_string(),
            handle,
        })
    }

    fn claim(&self, user_id: &str, cancel: CancelFlag) -> Result<ActiveSlot, SessionError> {
        let mut active = lock(&self.active);
        if active.contains_key(user_id) {
            tracing::warn!(user_id, "login rejected, session already running");
            return Err(SessionError::SessionAlreadyActive(user_id.to_string()));
        }
        active.insert(user_id.to_string(), cancel);
        Ok(ActiveSlot {
            user_id: user_id.to_string(),
            active: self.active.clone(),
        })
    }

    /// Users with a session in flight, sorted.
    pub fn active_users(&self) -> Vec<String> {
        let mut users: Vec<String> = lock(&self.active).keys().cloned().collect();
        users.sort();
        users
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        lock(&self.active).contains_key(user_id)
    }

    /// Ask one user's session to stop. Returns false if none is running.
    pub fn cancel(&self, user_id: &str) -> bool {
        match lock(&self.active).get(user_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask every running session to stop.
    pub fn shutdown(&self) {
        let active = lock(&self.active);
        for (user_id, flag) in active.iter() {
            tracing::info!(user_id = %user_id, "cancelling session");
            flag.cancel();
        }
    }
}

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<String, CancelFlag>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}
