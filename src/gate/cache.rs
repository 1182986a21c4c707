//! TTL-bounded snapshot of the site-mode settings.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{setting_enabled, SettingsStore};
use crate::config::SettingsKeys;
use crate::metrics::{BackendCall, Metrics, RefreshLabels, RefreshOutcome};

/// Effective site mode.  Gated wins when both flags are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteMode {
    Normal,
    Gated,
    Maintenance,
}

/// Immutable settings snapshot, replaced wholesale on refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteModeSnapshot {
    pub maintenance_enabled: bool,
    pub gate_enabled: bool,
    /// Epoch millis of the last refresh attempt; `None` before the first.
    pub last_refreshed_at: Option<i64>,
}

impl SiteModeSnapshot {
    pub fn mode(&self) -> SiteMode {
        if self.gate_enabled {
            SiteMode::Gated
        } else if self.maintenance_enabled {
            SiteMode::Maintenance
        } else {
            SiteMode::Normal
        }
    }

    fn is_stale(&self, now_ms: i64, ttl_ms: i64) -> bool {
        match self.last_refreshed_at {
            None => true,
            Some(last) => now_ms - last > ttl_ms,
        }
    }
}

pub struct SettingsCache {
    store: Arc<dyn SettingsStore>,
    keys: SettingsKeys,
    ttl_ms: i64,
    timeout: Duration,
    metrics: Arc<Metrics>,
    snapshot: RwLock<SiteModeSnapshot>,
}

impl SettingsCache {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        keys: SettingsKeys,
        ttl: Duration,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            timeout,
            metrics,
            snapshot: RwLock::new(SiteModeSnapshot::default()),
        }
    }

    /// Current snapshot without refreshing.
    pub fn get(&self) -> SiteModeSnapshot {
        *self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a snapshot no older than the TTL, refreshing from the store
    /// when needed.  Never fails: a store error or timeout yields both flags
    /// off, with the refresh time stamped anyway.
    ///
    /// Concurrent stale readers may each refresh; the last write wins.
    pub async fn refresh_if_stale(&self, now_ms: i64) -> SiteModeSnapshot {
        let current = self.get();
        if !current.is_stale(now_ms, self.ttl_ms) {
            self.metrics.settings_cache_hits.inc();
            return current;
        }

        let keys = [self.keys.maintenance_key.as_str(), self.keys.gate_key.as_str()];
        let fetched = tokio::time::timeout(self.timeout, self.store.get_many(&keys)).await;

        let (snapshot, outcome) = match fetched {
            Ok(Ok(values)) => (
                SiteModeSnapshot {
                    maintenance_enabled: setting_enabled(values.get(&self.keys.maintenance_key)),
                    gate_enabled: setting_enabled(values.get(&self.keys.gate_key)),
                    last_refreshed_at: Some(now_ms),
                },
                RefreshOutcome::Ok,
            ),
            Ok(Err(e)) => {
                warn!(error = %e, "settings refresh failed, disabling site modes");
                (Self::fallback(now_ms), RefreshOutcome::Error)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "settings refresh timed out, disabling site modes"
                );
                (Self::fallback(now_ms), RefreshOutcome::Timeout)
            }
        };

        if outcome != RefreshOutcome::Ok {
            self.metrics.backend_failure(BackendCall::Settings);
        }
        self.metrics
            .settings_refresh_total
            .get_or_create(&RefreshLabels { outcome })
            .inc();

        debug!(
            maintenance = snapshot.maintenance_enabled,
            gate = snapshot.gate_enabled,
            "settings snapshot refreshed"
        );
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        snapshot
    }

    fn fallback(now_ms: i64) -> SiteModeSnapshot {
        SiteModeSnapshot {
            maintenance_enabled: false,
            gate_enabled: false,
            last_refreshed_at: Some(now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use serde_json::{json, Value};

    use crate::metrics::MetricsRegistry;

    /// Store that counts calls and returns whatever is currently configured.
    struct CountingStore {
        calls: AtomicUsize,
        values: Mutex<Option<HashMap<String, Value>>>,
    }

    impl CountingStore {
        fn with(values: &[(&str, Value)]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                values: Mutex::new(Some(
                    values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                )),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                values: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SettingsStore for CountingStore {
        async fn get_many(&self, _keys: &[&str]) -> Result<HashMap<String, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.values.lock().unwrap().clone() {
                Some(v) => Ok(v),
                None => bail!("backend unreachable"),
            }
        }
    }

    struct SlowStore;

    #[async_trait::async_trait]
    impl SettingsStore for SlowStore {
        async fn get_many(&self, _keys: &[&str]) -> Result<HashMap<String, Value>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HashMap::from([("gate_mode".to_string(), json!(true))]))
        }
    }

    fn cache(store: Arc<dyn SettingsStore>) -> SettingsCache {
        SettingsCache::new(
            store,
            SettingsKeys::default(),
            Duration::from_secs(30),
            Duration::from_millis(50),
            MetricsRegistry::new().metrics,
        )
    }

    #[test]
    fn test_mode_precedence() {
        let mut s = SiteModeSnapshot::default();
        assert_eq!(s.mode(), SiteMode::Normal);
        s.maintenance_enabled = true;
        assert_eq!(s.mode(), SiteMode::Maintenance);
        s.gate_enabled = true;
        assert_eq!(s.mode(), SiteMode::Gated);
    }

    #[tokio::test]
    async fn test_reads_both_flag_encodings() {
        let store = CountingStore::with(&[
            ("maintenance_mode", json!("true")),
            ("gate_mode", json!(true)),
        ]);
        let c = cache(store);
        let snap = c.refresh_if_stale(1_000).await;
        assert!(snap.maintenance_enabled);
        assert!(snap.gate_enabled);
        assert_eq!(snap.last_refreshed_at, Some(1_000));
        assert_eq!(c.get(), snap);
    }

    #[tokio::test]
    async fn test_missing_or_odd_values_are_off() {
        let store = CountingStore::with(&[
            ("maintenance_mode", json!("TRUE")),
            ("gate_mode", json!(1)),
        ]);
        let snap = cache(store).refresh_if_stale(0).await;
        assert!(!snap.maintenance_enabled);
        assert!(!snap.gate_enabled);
    }

    #[tokio::test]
    async fn test_ttl_bounds_fetches() {
        let store = CountingStore::with(&[("gate_mode", json!(true))]);
        let c = cache(store.clone());

        c.refresh_if_stale(0).await;
        assert_eq!(store.calls(), 1);

        c.refresh_if_stale(29_999).await;
        c.refresh_if_stale(30_000).await;
        assert_eq!(store.calls(), 1, "within TTL: no refetch");

        c.refresh_if_stale(30_001).await;
        assert_eq!(store.calls(), 2, "past TTL: refetch");
    }

    #[tokio::test]
    async fn test_settings_change_visible_after_ttl() {
        let store = CountingStore::with(&[("maintenance_mode", json!(false))]);
        let c = cache(store.clone());
        assert!(!c.refresh_if_stale(0).await.maintenance_enabled);

        *store.values.lock().unwrap() =
            Some(HashMap::from([("maintenance_mode".to_string(), json!(true))]));
        assert!(!c.refresh_if_stale(10_000).await.maintenance_enabled);
        assert!(c.refresh_if_stale(40_000).await.maintenance_enabled);
    }

    #[tokio::test]
    async fn test_failure_falls_back_and_stamps() {
        let store = CountingStore::failing();
        let c = cache(store.clone());
        let snap = c.refresh_if_stale(5_000).await;
        assert!(!snap.maintenance_enabled);
        assert!(!snap.gate_enabled);
        assert_eq!(snap.last_refreshed_at, Some(5_000));

        // Stamped, so no refresh storm.
        c.refresh_if_stale(6_000).await;
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_overwrites_previous_flags() {
        let store = CountingStore::with(&[("gate_mode", json!(true))]);
        let c = cache(store.clone());
        assert!(c.refresh_if_stale(0).await.gate_enabled);

        *store.values.lock().unwrap() = None;
        assert!(!c.refresh_if_stale(31_000).await.gate_enabled);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let c = cache(Arc::new(SlowStore));
        let snap = c.refresh_if_stale(0).await;
        assert!(!snap.gate_enabled);
        assert_eq!(snap.last_refreshed_at, Some(0));
    }
}
