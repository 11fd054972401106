//! Reconciliation pipeline: join, cache, filter and export SB2 valuation snapshots.

pub mod cache;
pub mod export;
pub mod filter;
pub mod import;
mod reconcile;

use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use valrec_core::{ComparePolicy, PolicyError, Side, Snapshot};
use valrec_source::{BranchSet, PgRecordSource, RecordSource, SourceError, SourcesConfig};

pub use cache::{CacheError, ReplicaLoader, SnapshotCache, SnapshotLoader};
pub use filter::{apply, paginate, DiffStatus, Filtered, Page, ReportFilter, Selection, Totals, PAGE_SIZE};
pub use import::{ImportError, ImportReconciliation};
pub use reconcile::reconcile;

pub const CRATE_NAME: &str = "valrec-engine";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("invalid comparison policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sources: SourcesConfig,
    pub policy: ComparePolicy,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sources = SourcesConfig::from_lookup(&lookup)?;
        let policy = policy_from_lookup(&lookup)?;
        Ok(Self { sources, policy })
    }
}

/// Read `VALREC_PRECISION`, `VALREC_EPSILON`, `VALREC_COMPARE_QUANTITY` and
/// `VALREC_COMPARE_DATE`, falling back to [`ComparePolicy::default`].
pub fn policy_from_lookup<F>(lookup: F) -> Result<ComparePolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ComparePolicy::default();
    let precision = match lookup("VALREC_PRECISION") {
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| ConfigError::Invalid {
            key: "VALREC_PRECISION",
            value: raw,
        })?,
        None => defaults.precision,
    };
    let epsilon = match lookup("VALREC_EPSILON") {
        Some(raw) => Decimal::from_str(raw.trim()).map_err(|_| ConfigError::Invalid {
            key: "VALREC_EPSILON",
            value: raw,
        })?,
        None => defaults.epsilon,
    };
    let flag = |key: &str| {
        lookup(key)
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
    };
    let policy = ComparePolicy {
        precision,
        epsilon,
        compare_quantity: flag("VALREC_COMPARE_QUANTITY"),
        compare_movement_date: flag("VALREC_COMPARE_DATE"),
    };
    policy.validate()?;
    Ok(policy)
}

/// Entry point shared by the web and CLI front ends.
pub struct Reconciler {
    cache: SnapshotCache,
    prod: Arc<dyn RecordSource>,
    branches: BranchSet,
    policy: ComparePolicy,
}

impl Reconciler {
    pub fn new(
        test: Arc<dyn RecordSource>,
        prod: Arc<dyn RecordSource>,
        branches: BranchSet,
        policy: ComparePolicy,
    ) -> Self {
        let loader = ReplicaLoader::new(test, Arc::clone(&prod), branches.clone(), policy.clone());
        Self {
            cache: SnapshotCache::new(Arc::new(loader)),
            prod,
            branches,
            policy,
        }
    }

    /// Wire both replicas through lazily connecting Postgres pools.
    pub fn from_config(config: &EngineConfig) -> Self {
        let sources = &config.sources;
        let test = PgRecordSource::new(Side::Test, &sources.test, sources.connect_timeout);
        let prod = PgRecordSource::new(Side::Prod, &sources.prod, sources.connect_timeout);
        Self::new(
            Arc::new(test),
            Arc::new(prod),
            sources.branches.clone(),
            config.policy.clone(),
        )
    }

    pub fn policy(&self) -> &ComparePolicy {
        &self.policy
    }

    pub fn branches(&self) -> &BranchSet {
        &self.branches
    }

    pub async fn snapshot(&self, force_reload: bool) -> Result<Arc<Snapshot>, CacheError> {
        self.cache.get(force_reload).await
    }

    pub async fn import<R: Read>(&self, reader: R) -> Result<ImportReconciliation, ImportError> {
        import::reconcile_upload(reader, self.prod.as_ref(), &self.branches, &self.policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use valrec_core::RawRecord;
    use valrec_source::InMemorySource;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn policy_defaults_when_unset() {
        let policy = policy_from_lookup(env(&[])).expect("policy");
        assert_eq!(policy, ComparePolicy::default());
    }

    #[test]
    fn policy_reads_overrides() {
        let policy = policy_from_lookup(env(&[
            ("VALREC_PRECISION", "2"),
            ("VALREC_EPSILON", "0.000001"),
            ("VALREC_COMPARE_QUANTITY", "true"),
        ]))
        .expect("policy");
        assert_eq!(policy.precision, 2);
        assert_eq!(policy.epsilon, Decimal::new(1, 6));
        assert!(policy.compare_quantity);
        assert!(!policy.compare_movement_date);
    }

    #[test]
    fn policy_rejects_epsilon_wider_than_rounding_unit() {
        let err = policy_from_lookup(env(&[("VALREC_PRECISION", "2"), ("VALREC_EPSILON", "0.5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(PolicyError::EpsilonTooLarge { .. })));
        let err = policy_from_lookup(env(&[("VALREC_PRECISION", "six")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VALREC_PRECISION", .. }));
    }

    #[tokio::test]
    async fn reconciler_serves_filtered_snapshot() {
        let row = |branch: &str, product: &str, value: i64| RawRecord {
            branch: branch.into(),
            product: product.into(),
            location: "01".into(),
            total_value: Decimal::from(value),
            average_cost: Decimal::ONE,
            quantity: None,
            movement_date: Some("20240110".into()),
        };
        let test = InMemorySource::new(Side::Test, vec![row("A", "1", 5), row("B", "2", 7)]);
        let prod = InMemorySource::new(Side::Prod, vec![row("A", "1", 5), row("B", "2", 6)]);
        let reconciler = Reconciler::new(
            Arc::new(test),
            Arc::new(prod),
            BranchSet::new(["A", "B"]).unwrap(),
            ComparePolicy::default(),
        );
        let snapshot = reconciler.snapshot(false).await.expect("snapshot");
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.available_years(), vec!["2024"]);

        let filter = ReportFilter {
            status: DiffStatus::Diff,
            ..ReportFilter::default()
        };
        let filtered = apply(&snapshot.records, &filter);
        assert_eq!(filtered.records.len(), 1);
        assert_eq!(filtered.records[0].branch, "B");
        assert_eq!(filtered.totals.test_total_value, Decimal::from(7));
        assert_eq!(filtered.totals.prod_total_value, Decimal::from(6));
    }
}
