//! Core data model, key normalization and comparison policy for valrec.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "valrec-core";

/// Largest display precision accepted by [`ComparePolicy::validate`].
pub const MAX_PRECISION: u32 = 12;

/// Which replica a record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Test,
    Prod,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// One inventory valuation row as read from a replica (SB2 layout).
///
/// String fields may still carry the fixed-width space padding of the source
/// table; run [`normalize`] before building keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub branch: String,
    pub product: String,
    pub location: String,
    /// Total stock value (`B2_VATU1`).
    pub total_value: Decimal,
    /// Average unit cost (`B2_CM1`).
    pub average_cost: Decimal,
    pub quantity: Option<Decimal>,
    /// Last movement date, `YYYYMMDD`.
    pub movement_date: Option<String>,
}

/// Join key shared by both replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub branch: String,
    pub product: String,
    pub location: String,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.branch, self.product, self.location)
    }
}

/// Strip the trailing pad of a fixed-width column value.
pub fn trim_field(value: &str) -> &str {
    value.trim_end()
}

/// Canonicalize the string columns of a raw record. Numeric columns pass through.
///
/// Both sides of a reconciliation must go through this exact function before
/// their keys are compared.
pub fn normalize(raw: &RawRecord) -> RawRecord {
    RawRecord {
        branch: trim_field(&raw.branch).to_string(),
        product: trim_field(&raw.product).to_string(),
        location: trim_field(&raw.location).to_string(),
        total_value: raw.total_value,
        average_cost: raw.average_cost,
        quantity: raw.quantity,
        movement_date: raw
            .movement_date
            .as_deref()
            .map(trim_field)
            .filter(|d| !d.is_empty())
            .map(ToString::to_string),
    }
}

impl RawRecord {
    /// Key of an already normalized record.
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            branch: self.branch.clone(),
            product: self.product.clone(),
            location: self.location.clone(),
        }
    }
}

/// Four-character year prefix of a `YYYYMMDD...` date, if it has one.
pub fn year_prefix(date: &str) -> Option<&str> {
    let prefix = date.get(..4)?;
    prefix.chars().all(|c| c.is_ascii_digit()).then_some(prefix)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("precision {0} exceeds the maximum of {MAX_PRECISION} decimals")]
    PrecisionTooLarge(u32),
    #[error("epsilon {0} must not be negative")]
    NegativeEpsilon(Decimal),
    #[error("epsilon {epsilon} must be smaller than the rounding unit {unit}")]
    EpsilonTooLarge { epsilon: Decimal, unit: Decimal },
}

/// The single precision/tolerance rule used for every comparison.
///
/// Values are rounded to `precision` decimals first; two rounded values differ
/// when their distance exceeds `epsilon`. Because `epsilon` is kept below the
/// rounding unit, any visible difference of one unit is always flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparePolicy {
    pub precision: u32,
    pub epsilon: Decimal,
    /// Whether quantity differences feed `has_diff`.
    pub compare_quantity: bool,
    /// Whether movement-date differences feed `has_diff`.
    pub compare_movement_date: bool,
}

impl Default for ComparePolicy {
    fn default() -> Self {
        Self {
            precision: 6,
            epsilon: Decimal::new(1, 7),
            compare_quantity: false,
            compare_movement_date: false,
        }
    }
}

impl ComparePolicy {
    pub fn rounding_unit(&self) -> Decimal {
        Decimal::new(1, self.precision)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.precision > MAX_PRECISION {
            return Err(PolicyError::PrecisionTooLarge(self.precision));
        }
        if self.epsilon.is_sign_negative() && !self.epsilon.is_zero() {
            return Err(PolicyError::NegativeEpsilon(self.epsilon));
        }
        let unit = self.rounding_unit();
        if self.epsilon >= unit {
            return Err(PolicyError::EpsilonTooLarge {
                epsilon: self.epsilon,
                unit,
            });
        }
        Ok(())
    }

    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.precision, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Compare two already rounded values.
    pub fn differs(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() > self.epsilon
    }
}

/// One joined test/prod pair with its comparison flags. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub branch: String,
    pub product: String,
    pub location: String,
    pub test_total_value: Decimal,
    pub test_average_cost: Decimal,
    pub prod_total_value: Decimal,
    pub prod_average_cost: Decimal,
    pub test_quantity: Option<Decimal>,
    pub prod_quantity: Option<Decimal>,
    /// Empty when the side has no movement date.
    pub test_movement_date: String,
    pub prod_movement_date: String,
    /// False when the key was missing on the prod replica and zeros were substituted.
    pub prod_present: bool,
    pub diff_total_value: bool,
    pub diff_average_cost: bool,
    pub diff_quantity: bool,
    pub diff_movement_date: bool,
    pub has_diff: bool,
}

impl ComparisonRecord {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            branch: self.branch.clone(),
            product: self.product.clone(),
            location: self.location.clone(),
        }
    }

    /// Year prefixes of the test and prod movement dates (either may be absent).
    pub fn years(&self) -> impl Iterator<Item = &str> {
        [
            year_prefix(&self.test_movement_date),
            year_prefix(&self.prod_movement_date),
        ]
        .into_iter()
        .flatten()
    }
}

/// Counters describing one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub test_rows: usize,
    pub prod_rows: usize,
    pub matched: usize,
    /// Prod keys never looked up by any test row.
    pub prod_only: usize,
    pub duplicate_test_keys: usize,
    pub duplicate_prod_keys: usize,
    pub diff_count: usize,
}

/// Output of the reconciliation engine. Pure function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub records: Vec<ComparisonRecord>,
    pub stats: ReconcileStats,
}

/// A reconciliation held by the cache, stamped with its build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<ComparisonRecord>,
    pub stats: ReconcileStats,
    /// Values replaced with a default while decoding source rows.
    pub substitutions: usize,
    pub built_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl Snapshot {
    pub fn new(
        reconciliation: Reconciliation,
        substitutions: usize,
        built_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            records: reconciliation.records,
            stats: reconciliation.stats,
            substitutions,
            built_at,
            elapsed_ms,
        }
    }

    /// Distinct year prefixes across every record, newest first.
    pub fn available_years(&self) -> Vec<String> {
        available_years(&self.records)
    }
}

pub fn available_years(records: &[ComparisonRecord]) -> Vec<String> {
    let years = records
        .iter()
        .flat_map(ComparisonRecord::years)
        .collect::<BTreeSet<_>>();
    years.into_iter().rev().map(ToString::to_string).collect()
}
