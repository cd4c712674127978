// ABOUTME: In-process registry of last-used times, session bindings and package install records
// ABOUTME: One async mutex guards all three maps; it is never held across engine calls

use crate::types::{PackageInstallStatus, PackageStatusKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct RegistryState {
    last_used: HashMap<String, DateTime<Utc>>,
    names: HashMap<String, String>,
    sessions: HashMap<String, String>,
    packages: HashMap<(String, PackageStatusKey), PackageInstallStatus>,
}

/// Entry counts removed by `clear`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedCounts {
    pub tracked: usize,
    pub sessions: usize,
    pub packages: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a sandbox as used now
    pub async fn touch(&self, sandbox_id: &str) {
        let mut state = self.state.lock().await;
        state.last_used.insert(sandbox_id.to_string(), Utc::now());
    }

    /// Mark a sandbox as used now and remember its container name
    pub async fn track(&self, sandbox_id: &str, name: &str) {
        let mut state = self.state.lock().await;
        state.last_used.insert(sandbox_id.to_string(), Utc::now());
        state
            .names
            .insert(name.trim_start_matches('/').to_string(), sandbox_id.to_string());
    }

    pub async fn last_used(&self, sandbox_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_used.get(sandbox_id).copied()
    }

    /// Purge every entry referencing the sandbox known by id or container name
    pub async fn forget(&self, id_or_name: &str) {
        let mut state = self.state.lock().await;
        let sandbox_id = state
            .names
            .get(id_or_name)
            .cloned()
            .unwrap_or_else(|| id_or_name.to_string());
        state.last_used.remove(&sandbox_id);
        state.names.retain(|_, id| *id != sandbox_id);
        state.sessions.retain(|_, id| *id != sandbox_id);
        state.packages.retain(|(id, _), _| *id != sandbox_id);
    }

    pub async fn clear(&self) -> ClearedCounts {
        let mut state = self.state.lock().await;
        let counts = ClearedCounts {
            tracked: state.last_used.len(),
            sessions: state.sessions.len(),
            packages: state.packages.len(),
        };
        state.last_used.clear();
        state.names.clear();
        state.sessions.clear();
        state.packages.clear();
        counts
    }

    pub async fn bind_session(&self, session_key: &str, sandbox_id: &str) {
        let mut state = self.state.lock().await;
        state
            .sessions
            .insert(session_key.to_string(), sandbox_id.to_string());
    }

    pub async fn session(&self, session_key: &str) -> Option<String> {
        self.state.lock().await.sessions.get(session_key).cloned()
    }

    /// Store several install records in one critical section
    pub async fn record_packages<I>(&self, sandbox_id: &str, records: I)
    where
        I: IntoIterator<Item = (PackageStatusKey, PackageInstallStatus)>,
    {
        let mut state = self.state.lock().await;
        for (key, status) in records {
            state.packages.insert((sandbox_id.to_string(), key), status);
        }
    }

    pub async fn package_status(
        &self,
        sandbox_id: &str,
        key: &PackageStatusKey,
    ) -> Option<PackageInstallStatus> {
        self.state
            .lock()
            .await
            .packages
            .get(&(sandbox_id.to_string(), key.clone()))
            .cloned()
    }

    /// Ids whose last use is strictly older than `cutoff`
    pub async fn idle_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .last_used
            .iter()
            .filter(|(_, used)| **used < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether `sandbox_id` is still tracked and unused since before `cutoff`
    pub async fn is_idle(&self, sandbox_id: &str, cutoff: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .await
            .last_used
            .get(sandbox_id)
            .is_some_and(|used| *used < cutoff)
    }

    pub async fn tracked_count(&self) -> usize {
        self.state.lock().await.last_used.len()
    }
}
