use crate::browser::{Browser, BrowserError, Page, StorageState};
use crate::metrics;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Slot {
    page: Option<Arc<dyn Page>>,
    last_used: Option<Instant>,
}

/// Exclusive use of one identity's authenticated context. Other acquirers
/// for the same identity wait until the lease is dropped.
pub struct SessionLease {
    identity: String,
    page: Arc<dyn Page>,
    guard: OwnedMutexGuard<Slot>,
}

impl SessionLease {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn page(&self) -> &dyn Page {
        self.page.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.guard.last_used = Some(Instant::now());
    }
}

/// One long-lived browser context per login identity, restored from disk
/// on first use and closed after sitting idle.
pub struct SessionPool {
    browser: Arc<dyn Browser>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
    storage_dir: PathBuf,
    idle_timeout: Duration,
}

impl SessionPool {
    pub fn new(browser: Arc<dyn Browser>, storage_dir: impl Into<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            browser,
            slots: Mutex::new(HashMap::new()),
            storage_dir: storage_dir.into(),
            idle_timeout,
        }
    }

    fn slot(&self, identity: &str) -> Arc<AsyncMutex<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, Arc<AsyncMutex<Slot>>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(identity, slot)| (identity.clone(), slot.clone()))
            .collect()
    }

    pub fn state_path(&self, identity: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}.json", sanitize_identity(identity)))
    }

    pub async fn acquire(&self, identity: &str) -> Result<SessionLease, BrowserError> {
        let mut guard = self.slot(identity).lock_owned().await;
        let fresh = guard
            .last_used
            .is_some_and(|at| at.elapsed() < self.idle_timeout);
        if let (Some(page), true) = (guard.page.clone(), fresh) {
            debug!(target = "dropship.browser", identity, "session_reused");
            return Ok(SessionLease {
                identity: identity.to_string(),
                page,
                guard,
            });
        }
        if let Some(stale) = guard.page.take() {
            close_quietly(stale.as_ref(), identity).await;
        }

        let page: Arc<dyn Page> = Arc::from(self.browser.new_context().await?);
        if let Some(state) = self.load_state(identity).await {
            if let Err(err) = page.restore_state(&state).await {
                warn!(target = "dropship.browser", identity, error = %err, "session_restore_failed");
            }
        }
        guard.page = Some(page.clone());
        info!(target = "dropship.browser", identity, "session_opened");
        metrics::browser_contexts(self.open_count());
        Ok(SessionLease {
            identity: identity.to_string(),
            page,
            guard,
        })
    }

    async fn load_state(&self, identity: &str) -> Option<StorageState> {
        let raw = tokio::fs::read(self.state_path(identity)).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(target = "dropship.browser", identity, error = %err, "session_state_corrupt");
                None
            }
        }
    }

    /// Saves cookies and local storage so a restart skips sign-in.
    pub async fn persist(&self, lease: &SessionLease) -> Result<(), BrowserError> {
        let state = lease.page().storage_state().await?;
        let raw = serde_json::to_vec_pretty(&state)
            .map_err(|err| BrowserError::Storage(err.to_string()))?;
        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|err| BrowserError::Storage(err.to_string()))?;
        let path = self.state_path(lease.identity());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|err| BrowserError::Storage(err.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| BrowserError::Storage(err.to_string()))?;
        debug!(target = "dropship.browser", identity = lease.identity(), "session_persisted");
        Ok(())
    }

    /// Closes the leased context so the next acquire starts clean. Used after
    /// challenges that leave the session unusable.
    pub async fn discard(&self, mut lease: SessionLease) {
        if let Some(page) = lease.guard.page.take() {
            close_quietly(page.as_ref(), &lease.identity).await;
        }
        lease.guard.last_used = None;
        info!(target = "dropship.browser", identity = lease.identity(), "session_discarded");
        drop(lease);
        metrics::browser_contexts(self.open_count());
    }

    /// Closes contexts idle past the timeout. Leased slots are skipped.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for (identity, slot) in self.snapshot() {
            let Ok(mut guard) = slot.try_lock_owned() else {
                continue;
            };
            let idle = guard
                .last_used
                .is_none_or(|at| at.elapsed() >= self.idle_timeout);
            if !idle {
                continue;
            }
            if let Some(page) = guard.page.take() {
                close_quietly(page.as_ref(), &identity).await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(target = "dropship.browser", evicted, "sessions_evicted");
            metrics::browser_contexts(self.open_count());
        }
        evicted
    }

    pub fn open_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|(_, slot)| slot.try_lock().map(|s| s.page.is_some()).unwrap_or(true))
            .count()
    }

    /// Waits for in-flight leases, closes every context, then the browser.
    pub async fn shutdown(&self) {
        for (identity, slot) in self.snapshot() {
            let mut guard = slot.lock().await;
            if let Some(page) = guard.page.take() {
                close_quietly(page.as_ref(), &identity).await;
            }
        }
        if let Err(err) = self.browser.close().await {
            warn!(target = "dropship.browser", error = %err, "browser_close_failed");
        }
        info!(target = "dropship.browser", "session_pool_closed");
    }
}

async fn close_quietly(page: &dyn Page, identity: &str) {
    if let Err(err) = page.close().await {
        warn!(target = "dropship.browser", identity, error = %err, "context_close_failed");
    }
}

/// File-safe form of a login identity.
pub fn sanitize_identity(identity: &str) -> String {
    identity
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{ScriptedBrowser, Site};
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sessions-{}", Uuid::new_v4()))
    }

    fn pool(idle: Duration) -> (SessionPool, Arc<crate::browser::testing::Recorder>, PathBuf) {
        let browser = ScriptedBrowser::new(Site::default());
        let recorder = browser.recorder.clone();
        let dir = temp_dir();
        (SessionPool::new(Arc::new(browser), &dir, idle), recorder, dir)
    }

    #[test]
    fn identities_become_file_names() {
        assert_eq!(sanitize_identity("Buyer@Example.com"), "buyer_example.com");
        assert_eq!(sanitize_identity("a/b\\c d"), "a_b_c_d");
    }

    #[tokio::test]
    async fn context_is_reused_while_fresh() {
        let (pool, recorder, _) = pool(Duration::from_secs(60));
        drop(pool.acquire("buyer@example.com").await.unwrap());
        drop(pool.acquire("buyer@example.com").await.unwrap());
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 1);
        drop(pool.acquire("other@example.com").await.unwrap());
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 2);
    }

    #[tokio::test]
    async fn idle_context_is_replaced() {
        let (pool, recorder, _) = pool(Duration::ZERO);
        drop(pool.acquire("buyer").await.unwrap());
        drop(pool.acquire("buyer").await.unwrap());
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.closes(), 1);
    }

    #[tokio::test]
    async fn persisted_state_is_restored_into_new_context() {
        let (pool, recorder, dir) = pool(Duration::ZERO);
        let lease = pool.acquire("buyer@example.com").await.unwrap();
        pool.persist(&lease).await.unwrap();
        drop(lease);
        assert!(dir.join("buyer_example.com.json").exists());

        drop(pool.acquire("buyer@example.com").await.unwrap());
        let restored = recorder.restored.lock().unwrap().clone();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].origin, "https://shop.test");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn same_identity_is_serialized() {
        let (pool, _, _) = pool(Duration::from_secs(60));
        let pool = Arc::new(pool);
        let lease = pool.acquire("buyer").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("buyer").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(lease);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eviction_and_shutdown_close_everything() {
        let (pool, recorder, _) = pool(Duration::ZERO);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());
        assert_eq!(pool.evict_idle().await, 2);
        assert_eq!(recorder.closes(), 2);
        assert_eq!(pool.open_count(), 0);

        drop(pool.acquire("c").await.unwrap());
        pool.shutdown().await;
        assert_eq!(recorder.closes(), 3);
        assert!(recorder.browser_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn discard_forces_a_fresh_context() {
        let (pool, recorder, _) = pool(Duration::from_secs(60));
        let lease = pool.acquire("buyer").await.unwrap();
        pool.discard(lease).await;
        drop(pool.acquire("buyer").await.unwrap());
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.closes(), 1);
    }
}
