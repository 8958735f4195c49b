//! # In-Memory Lease
//!
//! [`LeaseLock`] shared between electors in one process. Used by tests and
//! by runs without a cluster.

use super::{LeaderElectionError, LeaseLock, LeaseRecord};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    record: Option<LeaseRecord>,
    next_version: u64,
    unavailable: bool,
}

impl State {
    fn store(&mut self, record: &LeaseRecord) -> LeaseRecord {
        self.next_version += 1;
        let stored = LeaseRecord {
            version: Some(self.next_version.to_string()),
            ..record.clone()
        };
        self.record = Some(stored.clone());
        stored
    }
}

/// In-memory [`LeaseLock`]
#[derive(Debug)]
pub struct MemoryLeaseLock {
    name: String,
    state: Mutex<State>,
}

impl MemoryLeaseLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_available(&self, state: &State) -> Result<(), LeaderElectionError> {
        if state.unavailable {
            return Err(LeaderElectionError::Invalid {
                name: self.name.clone(),
                message: "lease store unavailable".to_string(),
            });
        }
        Ok(())
    }

    pub fn holder(&self) -> Option<String> {
        self.lock().record.as_ref().and_then(|r| r.holder.clone())
    }

    pub fn transitions(&self) -> i32 {
        self.lock().record.as_ref().map_or(0, |r| r.transitions)
    }

    /// Overwrite the holder, as a competing replica would
    pub fn force_holder(&self, holder: &str) {
        let mut state = self.lock();
        if let Some(mut record) = state.record.clone() {
            record.holder = Some(holder.to_string());
            record.transitions = record.transitions.saturating_add(1);
            state.store(&record);
        }
    }

    /// Make every call fail, as during an API server outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        let state = self.lock();
        self.check_available(&state)?;
        Ok(state.record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        let mut state = self.lock();
        self.check_available(&state)?;
        if state.record.is_some() {
            return Err(LeaderElectionError::AlreadyExists(self.name.clone()));
        }
        Ok(state.store(record))
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        let mut state = self.lock();
        self.check_available(&state)?;
        let current_version = state.record.as_ref().and_then(|r| r.version.clone());
        if current_version.is_none() || current_version != record.version {
            return Err(LeaderElectionError::Conflict(self.name.clone()));
        }
        Ok(state.store(record))
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }
}
