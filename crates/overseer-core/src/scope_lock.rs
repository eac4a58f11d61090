use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use overseer_types::{new_id, LockConflict, LockRequest, ScopeLock};

use crate::clock::{to_chrono, SharedClock};

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LockError {
    #[error("scope conflict: {0}")]
    Conflict(LockConflict),
    #[error("lock not found: {0}")]
    NotFound(String),
    #[error("lock expired: {0}")]
    Expired(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("lock ttl must be greater than zero")]
    InvalidTtl,
}

type RootTable = Arc<Mutex<BTreeMap<String, ScopeLock>>>;

/// Exclusive locks over `(projectRoot, scopePath)` regions.
///
/// Every operation on a project root runs under that root's mutex, so the
/// overlap scan and the insert in [`ScopeLockManager::acquire`] are atomic.
pub struct ScopeLockManager {
    clock: SharedClock,
    roots: RwLock<HashMap<String, RootTable>>,
    index: Mutex<HashMap<String, (String, String)>>,
}

impl ScopeLockManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            roots: RwLock::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, request: &LockRequest) -> Result<ScopeLock, LockError> {
        if request.ttl_ms == 0 {
            return Err(LockError::InvalidTtl);
        }
        let root = normalize_scope(&request.project_root)?;
        let scope = normalize_scope(&request.scope_path)?;
        let table = self.table_for(&root);
        let mut entries = table.lock();
        let now = self.clock.now();

        let expired = drain_expired(&mut entries, now);
        if !expired.is_empty() {
            let mut index = self.index.lock();
            for id in &expired {
                index.remove(id);
            }
        }

        if let Some(holder) = entries
            .values()
            .find(|held| scopes_overlap(&held.scope_path, &scope))
        {
            tracing::debug!(
                "scope lock conflict: {} requested {} held by run {}",
                request.run_id,
                scope,
                holder.run_id
            );
            return Err(LockError::Conflict(LockConflict::from(holder)));
        }

        let lock = ScopeLock {
            id: new_id("lock"),
            run_id: request.run_id.clone(),
            scope_path: scope.clone(),
            project_root: root.clone(),
            acquired_at: now,
            expires_at: now + to_chrono(Duration::from_millis(request.ttl_ms)),
        };
        entries.insert(scope.clone(), lock.clone());
        self.index.lock().insert(lock.id.clone(), (root, scope));
        Ok(lock)
    }

    /// Releases a lock. Returns `false` when the lock was unknown or had already expired.
    pub fn release(&self, lock_id: &str) -> bool {
        let Some((root, scope)) = self.index.lock().remove(lock_id) else {
            return false;
        };
        let Some(table) = self.roots.read().get(&root).cloned() else {
            return false;
        };
        let mut entries = table.lock();
        let matches = entries.get(&scope).is_some_and(|held| held.id == lock_id);
        if !matches {
            return false;
        }
        let now = self.clock.now();
        entries
            .remove(&scope)
            .is_some_and(|released| released.is_live(now))
    }

    /// Reports whether `scope_path` could be acquired right now, with the live locks in the way.
    pub fn check(
        &self,
        scope_path: &str,
        project_root: &str,
    ) -> Result<(bool, Vec<ScopeLock>), LockError> {
        let root = normalize_scope(project_root)?;
        let scope = normalize_scope(scope_path)?;
        let Some(table) = self.roots.read().get(&root).cloned() else {
            return Ok((true, Vec::new()));
        };
        let entries = table.lock();
        let now = self.clock.now();
        let conflicts: Vec<ScopeLock> = entries
            .values()
            .filter(|held| held.is_live(now) && scopes_overlap(&held.scope_path, &scope))
            .cloned()
            .collect();
        Ok((conflicts.is_empty(), conflicts))
    }

    pub fn refresh(&self, lock_id: &str, extension: Duration) -> Result<ScopeLock, LockError> {
        let Some((root, scope)) = self.index.lock().get(lock_id).cloned() else {
            return Err(LockError::NotFound(lock_id.to_string()));
        };
        let table = self
            .roots
            .read()
            .get(&root)
            .cloned()
            .ok_or_else(|| LockError::NotFound(lock_id.to_string()))?;
        let mut entries = table.lock();
        let now = self.clock.now();
        match entries.get_mut(&scope) {
            Some(held) if held.id == lock_id => {
                if !held.is_live(now) {
                    return Err(LockError::Expired(lock_id.to_string()));
                }
                held.expires_at += to_chrono(extension);
                Ok(held.clone())
            }
            _ => Err(LockError::NotFound(lock_id.to_string())),
        }
    }

    pub fn get(&self, lock_id: &str) -> Option<ScopeLock> {
        let (root, scope) = self.index.lock().get(lock_id).cloned()?;
        let table = self.roots.read().get(&root).cloned()?;
        let entries = table.lock();
        entries.get(&scope).filter(|held| held.id == lock_id).cloned()
    }

    /// Live locks under `project_root`, ordered by scope path.
    pub fn list(&self, project_root: &str) -> Vec<ScopeLock> {
        let Ok(root) = normalize_scope(project_root) else {
            return Vec::new();
        };
        let Some(table) = self.roots.read().get(&root).cloned() else {
            return Vec::new();
        };
        let now = self.clock.now();
        let entries = table.lock();
        entries
            .values()
            .filter(|held| held.is_live(now))
            .cloned()
            .collect()
    }

    /// Evicts expired entries across all roots. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let tables: Vec<RootTable> = self.roots.read().values().cloned().collect();
        let now = self.clock.now();
        let mut removed = Vec::new();
        for table in tables {
            removed.extend(drain_expired(&mut table.lock(), now));
        }
        if !removed.is_empty() {
            let mut index = self.index.lock();
            for id in &removed {
                index.remove(id);
            }
            tracing::debug!("scope lock sweeper evicted {} expired locks", removed.len());
        }
        removed.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.clock.timer(interval) => {
                        manager.sweep();
                    }
                }
            }
        })
    }

    fn table_for(&self, root: &str) -> RootTable {
        if let Some(table) = self.roots.read().get(root) {
            return Arc::clone(table);
        }
        Arc::clone(self.roots.write().entry(root.to_string()).or_default())
    }
}

fn drain_expired(
    entries: &mut BTreeMap<String, ScopeLock>,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<String> {
    let mut removed = Vec::new();
    entries.retain(|_, held| {
        let live = held.is_live(now);
        if !live {
            removed.push(held.id.clone());
        }
        live
    });
    removed
}

/// Sweeper cadence for a given lock TTL: `min(ttl / 4, 30s)`.
pub fn sweep_interval(ttl: Duration) -> Duration {
    (ttl / 4).min(MAX_SWEEP_INTERVAL)
}

/// Canonical form of a scope or project root: forward slashes, a single
/// leading `/`, no trailing `/`, and `.`/`..` segments resolved.
pub fn normalize_scope(raw: &str) -> Result<String, LockError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LockError::InvalidScope("path is empty".to_string()));
    }
    let unified = trimmed.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(LockError::InvalidScope(format!(
                        "'{}' escapes its root",
                        raw
                    )));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Equal, ancestor or descendant, respecting segment boundaries.
pub fn scopes_overlap(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

fn is_ancestor(parent: &str, child: &str) -> bool {
    if parent == "/" {
        return true;
    }
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn request(run_id: &str, scope: &str) -> LockRequest {
        LockRequest {
            run_id: run_id.to_string(),
            scope_path: scope.to_string(),
            project_root: "/proj".to_string(),
            ttl_ms: 60_000,
        }
    }

    fn manager() -> (ManualClock, ScopeLockManager) {
        let clock = ManualClock::default();
        let manager = ScopeLockManager::new(Arc::new(clock.clone()));
        (clock, manager)
    }

    #[test]
    fn normalize_scope_canonicalizes() {
        assert_eq!(normalize_scope("src/").unwrap(), "/src");
        assert_eq!(normalize_scope(" /src//pkg/./x/../ ").unwrap(), "/src/pkg");
        assert_eq!(normalize_scope("C:\\work\\repo").unwrap(), "/C:/work/repo");
        assert_eq!(normalize_scope("/").unwrap(), "/");
        assert!(matches!(normalize_scope("   "), Err(LockError::InvalidScope(_))));
        assert!(matches!(normalize_scope("/a/../.."), Err(LockError::InvalidScope(_))));
    }

    #[test]
    fn overlap_is_symmetric_and_boundary_safe() {
        assert!(scopes_overlap("/src", "/src"));
        assert!(scopes_overlap("/src", "/src/pkg"));
        assert!(scopes_overlap("/src/pkg", "/src"));
        assert!(!scopes_overlap("/a", "/ab"));
        assert!(!scopes_overlap("/ab", "/a"));
        assert!(scopes_overlap("/", "/anything"));
        assert!(!scopes_overlap("/src/a", "/src/b"));
    }

    #[test]
    fn overlapping_acquire_reports_holder() {
        let (_clock, manager) = manager();
        let first = manager.acquire(&request("run_1", "/src")).expect("first lock");
        let err = manager
            .acquire(&request("run_2", "/src/pkg"))
            .expect_err("nested scope must conflict");
        match err {
            LockError::Conflict(conflict) => {
                assert_eq!(conflict.holder_run_id, "run_1");
                assert_eq!(conflict.lock_id, first.id);
                assert_eq!(conflict.scope_path, "/src");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        manager.acquire(&request("run_3", "/docs")).expect("disjoint scope");
    }

    #[test]
    fn different_roots_do_not_conflict() {
        let (_clock, manager) = manager();
        manager.acquire(&request("run_1", "/src")).expect("first");
        let mut other_root = request("run_2", "/src");
        other_root.project_root = "/other".to_string();
        manager.acquire(&other_root).expect("separate root");
    }

    #[test]
    fn release_frees_scope_and_is_idempotent() {
        let (_clock, manager) = manager();
        let lock = manager.acquire(&request("run_1", "/src")).expect("lock");
        assert!(manager.release(&lock.id));
        assert!(!manager.release(&lock.id));
        manager.acquire(&request("run_2", "/src/pkg")).expect("reacquire");
    }

    #[test]
    fn check_lists_live_conflicts_without_mutation() {
        let (_clock, manager) = manager();
        manager.acquire(&request("run_1", "/src/a")).expect("a");
        manager.acquire(&request("run_2", "/src/b")).expect("b");
        let (ok, conflicts) = manager.check("/src", "/proj").expect("check");
        assert!(!ok);
        assert_eq!(conflicts.len(), 2);
        let (ok, conflicts) = manager.check("/lib", "/proj").expect("check");
        assert!(ok);
        assert!(conflicts.is_empty());
        assert_eq!(manager.list("/proj").len(), 2);
    }

    #[test]
    fn expired_lock_yields_and_release_is_noop() {
        let (clock, manager) = manager();
        let lock = manager.acquire(&request("run_1", "/src")).expect("lock");
        clock.advance(Duration::from_secs(61));
        let again = manager.acquire(&request("run_2", "/src")).expect("expired scope is free");
        assert!(!manager.release(&lock.id));
        assert!(manager.get(&again.id).is_some());
    }

    #[test]
    fn refresh_extends_only_live_locks() {
        let (clock, manager) = manager();
        let lock = manager.acquire(&request("run_1", "/src")).expect("lock");
        let refreshed = manager
            .refresh(&lock.id, Duration::from_secs(30))
            .expect("refresh");
        assert_eq!(refreshed.expires_at, lock.expires_at + chrono::Duration::seconds(30));

        clock.advance(Duration::from_secs(120));
        assert!(matches!(
            manager.refresh(&lock.id, Duration::from_secs(30)),
            Err(LockError::Expired(_))
        ));

        manager.sweep();
        assert!(matches!(
            manager.refresh(&lock.id, Duration::from_secs(30)),
            Err(LockError::NotFound(_))
        ));
    }

    #[test]
    fn sweep_interval_is_capped() {
        assert_eq!(sweep_interval(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(sweep_interval(Duration::from_secs(3600)), Duration::from_secs(30));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let (_clock, manager) = manager();
        let mut req = request("run_1", "/src");
        req.ttl_ms = 0;
        assert_eq!(manager.acquire(&req), Err(LockError::InvalidTtl));
    }

    #[tokio::test]
    async fn sweeper_evicts_after_tick() {
        let clock = ManualClock::default();
        let manager = Arc::new(ScopeLockManager::new(Arc::new(clock.clone())));
        let lock = manager.acquire(&request("run_1", "/src")).expect("lock");
        let cancel = CancellationToken::new();
        let handle = manager.spawn_sweeper(Duration::from_secs(15), cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        clock.advance(Duration::from_secs(75));
        for _ in 0..50 {
            if manager.get(&lock.id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.get(&lock.id).is_none());

        cancel.cancel();
        handle.await.expect("sweeper exits");
    }
}
