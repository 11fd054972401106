use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use valrec_core::{ComparePolicy, Snapshot};
use valrec_source::{BranchSet, RecordSource, SourceError};

use crate::reconcile::reconcile;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("reconciliation pass failed: {0}")]
    Source(#[from] SourceError),
}

/// Produces a fresh snapshot. One call is one full reconciliation pass.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load(&self) -> Result<Snapshot, SourceError>;
}

/// Loads both replicas and reconciles them.
pub struct ReplicaLoader {
    test: Arc<dyn RecordSource>,
    prod: Arc<dyn RecordSource>,
    branches: BranchSet,
    policy: ComparePolicy,
}

impl ReplicaLoader {
    pub fn new(
        test: Arc<dyn RecordSource>,
        prod: Arc<dyn RecordSource>,
        branches: BranchSet,
        policy: ComparePolicy,
    ) -> Self {
        Self {
            test,
            prod,
            branches,
            policy,
        }
    }
}

#[async_trait]
impl SnapshotLoader for ReplicaLoader {
    async fn load(&self) -> Result<Snapshot, SourceError> {
        info!("snapshot cache miss, loading both replicas");
        let started = Instant::now();

        let (test, prod) = tokio::try_join!(
            self.test.fetch(&self.branches),
            self.prod.fetch(&self.branches)
        )?;
        for (source, fetched) in [(&self.test, &test), (&self.prod, &prod)] {
            if fetched.substitutions > 0 {
                warn!(
                    side = %source.side(),
                    substitutions = fetched.substitutions,
                    "replica rows carried substituted values"
                );
            }
        }
        let reconciliation = reconcile(&test.records, &prod.records, &self.policy);

        let stats = &reconciliation.stats;
        if stats.duplicate_test_keys > 0 || stats.duplicate_prod_keys > 0 {
            warn!(
                duplicate_test_keys = stats.duplicate_test_keys,
                duplicate_prod_keys = stats.duplicate_prod_keys,
                "duplicate composite keys in replica data"
            );
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            records = stats.test_rows,
            diffs = stats.diff_count,
            prod_only = stats.prod_only,
            elapsed_ms,
            "snapshot built"
        );

        Ok(Snapshot::new(
            reconciliation,
            test.substitutions + prod.substitutions,
            Utc::now(),
            elapsed_ms,
        ))
    }
}

/// Single-slot snapshot cache with single-flight reloads.
///
/// At most one load runs at a time. Callers that queue behind an in-flight
/// load receive that load's outcome instead of starting another one. A failed
/// load leaves the previous snapshot in place.
pub struct SnapshotCache {
    loader: Arc<dyn SnapshotLoader>,
    slot: RwLock<Option<Arc<Snapshot>>>,
    reload: Mutex<Option<CacheError>>,
    attempts: AtomicU64,
}

impl SnapshotCache {
    pub fn new(loader: Arc<dyn SnapshotLoader>) -> Self {
        Self {
            loader,
            slot: RwLock::new(None),
            reload: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, force_reload: bool) -> Result<Arc<Snapshot>, CacheError> {
        let observed = self.attempts.load(Ordering::Acquire);
        if !force_reload {
            if let Some(snapshot) = self.peek().await {
                return Ok(snapshot);
            }
        }

        let mut last_error = self.reload.lock().await;
        if self.attempts.load(Ordering::Acquire) != observed {
            // another caller finished a load while we queued
            if let Some(err) = last_error.as_ref() {
                return Err(err.clone());
            }
            if let Some(snapshot) = self.peek().await {
                return Ok(snapshot);
            }
        }

        let outcome = self
            .loader
            .load()
            .await
            .map(Arc::new)
            .map_err(CacheError::from);
        match &outcome {
            Ok(snapshot) => {
                *self.slot.write().await = Some(Arc::clone(snapshot));
                *last_error = None;
            }
            Err(err) => {
                warn!(error = %err, "reconciliation pass failed, keeping previous snapshot");
                *last_error = Some(err.clone());
            }
        }
        // slot must be settled before waiters can observe the new attempt
        self.attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    /// The held snapshot, without loading.
    pub async fn peek(&self) -> Option<Arc<Snapshot>> {
        self.slot.read().await.clone()
    }

    /// Drop the held snapshot; the next `get` reloads.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use valrec_core::{RawRecord, Side};
    use valrec_source::{InMemorySource, UnreachableSource};

    fn raw(product: &str, a: &str) -> RawRecord {
        RawRecord {
            branch: "A".into(),
            product: product.into(),
            location: "01".into(),
            total_value: Decimal::from_str(a).unwrap(),
            average_cost: Decimal::ONE,
            quantity: None,
            movement_date: None,
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotLoader for CountingLoader {
        async fn load(&self) -> Result<Snapshot, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(SourceError::Connectivity {
                    side: Side::Prod,
                    message: "down".into(),
                });
            }
            let test = vec![raw("001", "1")];
            Ok(Snapshot::new(
                reconcile(&test, &[], &ComparePolicy::default()),
                0,
                Utc::now(),
                0,
            ))
        }
    }

    fn counting(fail: bool) -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn serves_cached_snapshot_until_forced() {
        let loader = counting(false);
        let cache = SnapshotCache::new(loader.clone());
        let first = cache.get(false).await.expect("first");
        let second = cache.get(false).await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        let third = cache.get(true).await.expect("reload");
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() {
        let loader = counting(false);
        let cache = Arc::new(SnapshotCache::new(loader.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(false).await }));
        }
        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.expect("join").expect("snapshot"));
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(snapshots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn concurrent_forced_reloads_share_one_load() {
        let loader = counting(false);
        let cache = Arc::new(SnapshotCache::new(loader.clone()));
        let (a, b) = tokio::join!(cache.get(true), cache.get(true));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let test: Arc<dyn RecordSource> =
            Arc::new(InMemorySource::new(Side::Test, vec![raw("001", "2")]));
        let prod: Arc<dyn RecordSource> =
            Arc::new(InMemorySource::new(Side::Prod, vec![raw("001", "1")]));
        let branches = BranchSet::new(["A"]).unwrap();
        let good = Arc::new(ReplicaLoader::new(
            test.clone(),
            prod,
            branches.clone(),
            ComparePolicy::default(),
        ));
        let cache = SnapshotCache::new(good);
        let before = cache.get(false).await.expect("initial load");
        assert_eq!(before.records.len(), 1);
        assert!(before.records[0].has_diff);

        let failing = SnapshotCache::new(counting(true));
        let err = failing.get(false).await.unwrap_err();
        assert!(matches!(err, CacheError::Source(SourceError::Connectivity { .. })));
        assert!(failing.peek().await.is_none());

        let broken = Arc::new(ReplicaLoader::new(
            test,
            Arc::new(UnreachableSource::new(Side::Prod)),
            branches,
            ComparePolicy::default(),
        ));
        let cache = SnapshotCache::new(broken);
        assert!(cache.get(true).await.is_err());
    }

    #[tokio::test]
    async fn stale_snapshot_survives_a_failed_forced_reload() {
        struct FlakyLoader {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl SnapshotLoader for FlakyLoader {
            async fn load(&self) -> Result<Snapshot, SourceError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Snapshot::new(Default::default(), 0, Utc::now(), 0))
                } else {
                    Err(SourceError::Connectivity {
                        side: Side::Test,
                        message: "timeout".into(),
                    })
                }
            }
        }

        let cache = SnapshotCache::new(Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
        }));
        let first = cache.get(false).await.expect("first");
        assert!(cache.get(true).await.is_err());
        let held = cache.peek().await.expect("still cached");
        assert!(Arc::ptr_eq(&first, &held));
        assert!(Arc::ptr_eq(&first, &cache.get(false).await.expect("cached")));
    }

    #[tokio::test]
    async fn invalidate_forces_next_get_to_load() {
        let loader = counting(false);
        let cache = SnapshotCache::new(loader.clone());
        cache.get(false).await.expect("load");
        cache.invalidate().await;
        assert!(cache.peek().await.is_none());
        cache.get(false).await.expect("reload");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }
}
