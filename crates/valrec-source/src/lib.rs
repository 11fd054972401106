//! Record source adapters: fetch SB2 valuation rows from the test and prod replicas.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use valrec_core::{normalize, RawRecord, Side};

pub const CRATE_NAME: &str = "valrec-source";

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SB2_QUERY: &str = r#"
    SELECT b2_filial::text  AS b2_filial,
           b2_cod::text     AS b2_cod,
           b2_local::text   AS b2_local,
           b2_vatu1::numeric AS b2_vatu1,
           b2_cm1::numeric  AS b2_cm1,
           b2_qatu::numeric AS b2_qatu,
           b2_dmov::text    AS b2_dmov
      FROM sb2010
     WHERE TRIM(b2_filial) = ANY($1)
       AND TRIM(d_e_l_e_t_) = ''
       AND TRIM(b2_cod) <> ''
       AND (b2_vatu1 <> 0 OR b2_cm1 <> 0)
     ORDER BY b2_filial, b2_cod, b2_local
"#;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{side} replica unreachable: {message}")]
    Connectivity { side: Side, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{side} replica query failed: {message}")]
    Query { side: Side, message: String },
}

/// Branch codes included in every fetch. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchSet(Vec<String>);

impl BranchSet {
    pub fn new<I, S>(codes: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for code in codes {
            let code = code.as_ref().trim();
            if !code.is_empty() && !out.iter().any(|c| c == code) {
                out.push(code.to_string());
            }
        }
        if out.is_empty() {
            return Err(SourceError::Configuration(
                "at least one branch code is required".to_string(),
            ));
        }
        Ok(Self(out))
    }

    pub fn parse(csv: &str) -> Result<Self, SourceError> {
        Self::new(csv.split(','))
    }

    pub fn codes(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|c| c == code)
    }
}

/// Connection bundle for one replica. Credentials have no built-in defaults.
#[derive(Clone)]
pub struct SourceConfig {
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub port: u16,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

impl SourceConfig {
    /// Read `VALREC_{TEST,PROD}_{HOST,DB,USER,PASSWORD,PORT}` through `lookup`.
    pub fn from_lookup<F>(side: Side, lookup: F) -> Result<Self, SourceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = match side {
            Side::Test => "VALREC_TEST",
            Side::Prod => "VALREC_PROD",
        };
        let required = |suffix: &str| -> Result<String, SourceError> {
            let key = format!("{prefix}_{suffix}");
            lookup(&key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SourceError::Configuration(format!("{key} is not set")))
        };
        let port_key = format!("{prefix}_PORT");
        let port = match lookup(&port_key) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                SourceError::Configuration(format!("{port_key} is not a valid port: {raw}"))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            host: required("HOST")?,
            database: required("DB")?,
            user: required("USER")?,
            password: required("PASSWORD")?,
            port,
        })
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Everything needed to reach both replicas.
#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub test: SourceConfig,
    pub prod: SourceConfig,
    pub branches: BranchSet,
    pub connect_timeout: Duration,
}

impl SourcesConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SourceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let branches = lookup("VALREC_BRANCHES")
            .ok_or_else(|| SourceError::Configuration("VALREC_BRANCHES is not set".into()))?;
        let connect_timeout = match lookup("VALREC_CONNECT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                SourceError::Configuration(format!(
                    "VALREC_CONNECT_TIMEOUT_SECS is not a number: {raw}"
                ))
            })?),
            None => DEFAULT_CONNECT_TIMEOUT,
        };
        Ok(Self {
            test: SourceConfig::from_lookup(Side::Test, &lookup)?,
            prod: SourceConfig::from_lookup(Side::Prod, &lookup)?,
            branches: BranchSet::parse(&branches)?,
            connect_timeout,
        })
    }
}

/// Rows returned by one fetch, already normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRecords {
    pub records: Vec<RawRecord>,
    /// Field values replaced by a default because they were NULL or undecodable.
    pub substitutions: usize,
}

/// A queryable replica. Implementations never retry; any failure aborts the pass.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn side(&self) -> Side;

    /// Rows of the configured branches that are live, have a product code and
    /// carry a non-zero value, ordered by (branch, product, location).
    async fn fetch(&self, branches: &BranchSet) -> Result<FetchedRecords, SourceError>;
}

pub struct PgRecordSource {
    side: Side,
    pool: PgPool,
}

impl PgRecordSource {
    /// Build a lazily connecting pool; no I/O happens until the first fetch.
    pub fn new(side: Side, config: &SourceConfig, connect_timeout: Duration) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect_lazy_with(config.connect_options());
        Self { side, pool }
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    fn side(&self) -> Side {
        self.side
    }

    async fn fetch(&self, branches: &BranchSet) -> Result<FetchedRecords, SourceError> {
        let side = self.side;
        let span = info_span!("source_fetch", %side, branches = branches.codes().len());
        async move {
            let rows = sqlx::query(SB2_QUERY)
                .bind(branches.codes().to_vec())
                .fetch_all(&self.pool)
                .await
                .map_err(|err| classify_sqlx_error(side, err))?;

            let mut substitutions = 0usize;
            let records = rows
                .iter()
                .map(|row| normalize(&decode_row(side, row, &mut substitutions)))
                .collect::<Vec<_>>();
            if substitutions > 0 {
                warn!(%side, substitutions, "substituted defaults for malformed fields");
            }
            info!(%side, rows = records.len(), "fetched valuation rows");
            Ok(FetchedRecords {
                records,
                substitutions,
            })
        }
        .instrument(span)
        .await
    }
}

/// Map a driver failure onto the source error kinds.
pub fn classify_sqlx_error(side: Side, err: sqlx::Error) -> SourceError {
    let message = err.to_string();
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SourceError::Connectivity { side, message },
        // 28xxx: invalid authorization, 3D000: unknown database
        sqlx::Error::Database(db)
            if db
                .code()
                .map(|code| code.starts_with("28") || code == "3D000")
                .unwrap_or(false) =>
        {
            SourceError::Connectivity { side, message }
        }
        sqlx::Error::Configuration(_) => SourceError::Configuration(message),
        _ => SourceError::Query { side, message },
    }
}

fn decode_row(side: Side, row: &PgRow, substitutions: &mut usize) -> RawRecord {
    RawRecord {
        branch: text_column(side, row, "b2_filial", substitutions),
        product: text_column(side, row, "b2_cod", substitutions),
        location: text_column(side, row, "b2_local", substitutions),
        total_value: decimal_column(side, row, "b2_vatu1", substitutions),
        average_cost: decimal_column(side, row, "b2_cm1", substitutions),
        quantity: optional_decimal_column(side, row, "b2_qatu", substitutions),
        movement_date: optional_text_column(side, row, "b2_dmov", substitutions),
    }
}

fn text_column(side: Side, row: &PgRow, column: &str, substitutions: &mut usize) -> String {
    settle_required(side, column, row.try_get(column), substitutions)
}

fn optional_text_column(
    side: Side,
    row: &PgRow,
    column: &str,
    substitutions: &mut usize,
) -> Option<String> {
    settle_optional(side, column, row.try_get(column), substitutions)
}

fn decimal_column(side: Side, row: &PgRow, column: &str, substitutions: &mut usize) -> Decimal {
    settle_required(side, column, row.try_get(column), substitutions)
}

fn optional_decimal_column(
    side: Side,
    row: &PgRow,
    column: &str,
    substitutions: &mut usize,
) -> Option<Decimal> {
    settle_optional(side, column, row.try_get(column), substitutions)
}

/// A required cell: NULL or undecodable becomes the default, counted once.
fn settle_required<T: Default>(
    side: Side,
    column: &str,
    decoded: Result<Option<T>, sqlx::Error>,
    substitutions: &mut usize,
) -> T {
    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => {
            *substitutions += 1;
            T::default()
        }
        Err(err) => {
            *substitutions += 1;
            warn!(%side, column, error = %err, "undecodable column, using default");
            T::default()
        }
    }
}

/// An optional cell: NULL is a legitimate absence, only decode failures count.
fn settle_optional<T>(
    side: Side,
    column: &str,
    decoded: Result<Option<T>, sqlx::Error>,
    substitutions: &mut usize,
) -> Option<T> {
    match decoded {
        Ok(value) => value,
        Err(err) => {
            *substitutions += 1;
            warn!(%side, column, error = %err, "undecodable column");
            None
        }
    }
}

/// Fixed record set honoring the same contract as the SQL adapter.
///
/// Used for uploaded data and in tests.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    side: Side,
    records: Vec<RawRecord>,
}

impl InMemorySource {
    pub fn new(side: Side, records: Vec<RawRecord>) -> Self {
        Self { side, records }
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    fn side(&self) -> Side {
        self.side
    }

    async fn fetch(&self, branches: &BranchSet) -> Result<FetchedRecords, SourceError> {
        let mut records = self
            .records
            .iter()
            .map(normalize)
            .filter(|r| branches.contains(&r.branch))
            .filter(|r| !r.product.is_empty())
            .filter(|r| !r.total_value.is_zero() || !r.average_cost.is_zero())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(FetchedRecords {
            records,
            substitutions: 0,
        })
    }
}

/// A source that always fails, for exercising error paths.
#[derive(Debug, Clone)]
pub struct UnreachableSource {
    side: Side,
}

impl UnreachableSource {
    pub fn new(side: Side) -> Self {
        Self { side }
    }
}

#[async_trait]
impl RecordSource for UnreachableSource {
    fn side(&self) -> Side {
        self.side
    }

    async fn fetch(&self, _branches: &BranchSet) -> Result<FetchedRecords, SourceError> {
        Err(SourceError::Connectivity {
            side: self.side,
            message: "connection refused".to_string(),
        })
    }
}
