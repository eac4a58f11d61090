use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLock {
    pub id: String,
    pub run_id: String,
    pub scope_path: String,
    pub project_root: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScopeLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub run_id: String,
    pub scope_path: String,
    pub project_root: String,
    pub ttl_ms: u64,
}

/// Summary of the live lock that blocked an acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockConflict {
    pub lock_id: String,
    pub holder_run_id: String,
    pub scope_path: String,
    pub project_root: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&ScopeLock> for LockConflict {
    fn from(lock: &ScopeLock) -> Self {
        Self {
            lock_id: lock.id.clone(),
            holder_run_id: lock.run_id.clone(),
            scope_path: lock.scope_path.clone(),
            project_root: lock.project_root.clone(),
            expires_at: lock.expires_at,
        }
    }
}

impl std::fmt::Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scope '{}' under '{}' is held by run {} (lock {})",
            self.scope_path, self.project_root, self.holder_run_id, self.lock_id
        )
    }
}
