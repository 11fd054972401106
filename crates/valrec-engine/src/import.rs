//! Reconcile an uploaded CSV against a live prod fetch.
//!
//! The result lives only for the request that produced it.

use std::io::Read;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;
use valrec_core::{ComparePolicy, RawRecord, Reconciliation};
use valrec_source::{BranchSet, RecordSource, SourceError};

use crate::reconcile::reconcile;

const REQUIRED_COLUMNS: [&str; 5] = ["branch", "product", "location", "total_value", "average_cost"];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("upload is not valid csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("upload is missing column '{0}'")]
    MissingColumn(&'static str),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUpload {
    pub records: Vec<RawRecord>,
    /// Cells that could not be parsed and were replaced by zero or empty.
    pub substitutions: usize,
}

#[derive(Debug, Clone)]
pub struct ImportReconciliation {
    pub reconciliation: Reconciliation,
    pub rows_read: usize,
    pub substitutions: usize,
}

struct Columns {
    branch: usize,
    product: usize,
    location: usize,
    total_value: usize,
    average_cost: usize,
    quantity: Option<usize>,
    movement_date: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, ImportError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let mut required = [0usize; 5];
        for (slot, name) in required.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = find(name).ok_or(ImportError::MissingColumn(name))?;
        }
        Ok(Self {
            branch: required[0],
            product: required[1],
            location: required[2],
            total_value: required[3],
            average_cost: required[4],
            quantity: find("quantity"),
            movement_date: find("movement_date"),
        })
    }
}

/// Parse an amount written either as `1234.56` or in Brazilian notation `1.234,56`.
///
/// A comma always marks Brazilian notation, so dots may only appear before it as
/// thousands groups. Anything else (`1,234.56`, `1,2,3`, `12.34.5,6`) is rejected.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let Some((int_part, frac_part)) = raw.split_once(',') else {
        return Decimal::from_str(raw).ok();
    };
    if frac_part.contains([',', '.']) || !valid_br_groups(int_part) {
        return None;
    }
    Decimal::from_str(&format!("{}.{frac_part}", int_part.replace('.', ""))).ok()
}

fn valid_br_groups(int_part: &str) -> bool {
    let digits = int_part.trim_start_matches(['-', '+']);
    if !digits.contains('.') {
        return true;
    }
    let mut groups = digits.split('.');
    groups.next().is_some_and(|g| (1..=3).contains(&g.len())) && groups.all(|g| g.len() == 3)
}

/// Dates must start with a calendar `YYYYMMDD`.
fn valid_movement_date(raw: &str) -> bool {
    raw.get(..8)
        .is_some_and(|ymd| NaiveDate::parse_from_str(ymd, "%Y%m%d").is_ok())
}

pub fn parse_upload<R: Read>(reader: R) -> Result<ParsedUpload, ImportError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = Columns::resolve(csv_reader.headers()?)?;

    let mut substitutions = 0usize;
    let mut records = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let text = |idx: usize| row.get(idx).unwrap_or_default().to_string();
        let mut amount = |idx: usize| match parse_amount(row.get(idx).unwrap_or_default()) {
            Some(value) => value,
            None => {
                substitutions += 1;
                Decimal::ZERO
            }
        };
        let total_value = amount(columns.total_value);
        let average_cost = amount(columns.average_cost);
        let quantity = match columns.quantity.map(text).filter(|q| !q.is_empty()) {
            Some(cell) => {
                let parsed = parse_amount(&cell);
                if parsed.is_none() {
                    substitutions += 1;
                }
                parsed
            }
            None => None,
        };
        let movement_date = match columns.movement_date.map(text).filter(|d| !d.is_empty()) {
            Some(cell) if valid_movement_date(&cell) => Some(cell),
            Some(_) => {
                substitutions += 1;
                None
            }
            None => None,
        };
        records.push(RawRecord {
            branch: text(columns.branch),
            product: text(columns.product),
            location: text(columns.location),
            total_value,
            average_cost,
            quantity,
            movement_date,
        });
    }
    if substitutions > 0 {
        warn!(substitutions, "unparseable cells in upload replaced with defaults");
    }
    Ok(ParsedUpload {
        records,
        substitutions,
    })
}

/// Reconcile uploaded rows (as the test side) against a fresh prod fetch.
pub async fn reconcile_upload<R: Read>(
    reader: R,
    prod: &dyn RecordSource,
    branches: &BranchSet,
    policy: &ComparePolicy,
) -> Result<ImportReconciliation, ImportError> {
    let upload = parse_upload(reader)?;
    let fetched = prod.fetch(branches).await?;
    let reconciliation = reconcile(&upload.records, &fetched.records, policy);
    Ok(ImportReconciliation {
        rows_read: upload.records.len(),
        substitutions: upload.substitutions + fetched.substitutions,
        reconciliation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use valrec_core::Side;
    use valrec_source::{InMemorySource, UnreachableSource};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn amounts_accept_plain_and_brazilian_notation() {
        assert_eq!(parse_amount("1234.5"), Some(dec("1234.5")));
        assert_eq!(parse_amount("1.234,567890"), Some(dec("1234.567890")));
        assert_eq!(parse_amount("12,5"), Some(dec("12.5")));
        assert_eq!(parse_amount("-12.345,6"), Some(dec("-12345.6")));
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("  "), None);
    }

    #[test]
    fn mixed_separator_notation_is_rejected() {
        assert_eq!(parse_amount("1,234.56"), None);
        assert_eq!(parse_amount("1,234,567"), None);
        assert_eq!(parse_amount("12.34,5"), None);
        assert_eq!(parse_amount("1234.567,8"), None);
        assert_eq!(parse_amount("1.234.567,8"), Some(dec("1234567.8")));
    }

    #[test]
    fn headers_are_case_insensitive_and_optional_columns_may_be_absent() {
        let csv = "Branch,PRODUCT,location,Total_Value,average_cost\nA,001,01,10,2\n";
        let parsed = parse_upload(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].total_value, dec("10"));
        assert_eq!(parsed.records[0].quantity, None);
        assert_eq!(parsed.substitutions, 0);
    }

    #[test]
    fn missing_required_column_is_reported() {
        let csv = "branch,product,location,total_value\nA,001,01,10\n";
        let err = parse_upload(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, ImportError::MissingColumn("average_cost")));
    }

    #[test]
    fn bad_amounts_are_substituted_and_counted() {
        let csv = "branch,product,location,total_value,average_cost,quantity,movement_date\n\
                   A,001,01,abc,1,2,20240102\n\
                   A,002,01,5,,,\n";
        let parsed = parse_upload(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.substitutions, 2);
        assert_eq!(parsed.records[0].total_value, Decimal::ZERO);
        assert_eq!(parsed.records[0].quantity, Some(dec("2")));
        assert_eq!(parsed.records[0].movement_date.as_deref(), Some("20240102"));
        assert_eq!(parsed.records[1].movement_date, None);
    }

    #[test]
    fn bad_quantity_and_date_cells_are_counted() {
        let csv = "branch,product,location,total_value,average_cost,quantity,movement_date\n\
                   A,001,01,5,1,abc,2024\n\
                   A,002,01,5,1,\"1,234.56\",20241399\n\
                   A,003,01,5,1,7,20240229\n";
        let parsed = parse_upload(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.substitutions, 4);
        assert_eq!(parsed.records[0].quantity, None);
        assert_eq!(parsed.records[0].movement_date, None);
        assert_eq!(parsed.records[1].quantity, None);
        assert_eq!(parsed.records[1].movement_date, None);
        assert_eq!(parsed.records[2].quantity, Some(dec("7")));
        assert_eq!(parsed.records[2].movement_date.as_deref(), Some("20240229"));
    }

    #[tokio::test]
    async fn upload_is_reconciled_in_upload_order() {
        let prod = InMemorySource::new(
            Side::Prod,
            vec![RawRecord {
                branch: "A".into(),
                product: "002".into(),
                location: "01".into(),
                total_value: dec("5"),
                average_cost: dec("1"),
                quantity: None,
                movement_date: None,
            }],
        );
        let csv = "branch,product,location,total_value,average_cost\n\
                   A,002,01,5,1\n\
                   A,001,01,7,1\n";
        let branches = BranchSet::new(["A"]).unwrap();
        let out = reconcile_upload(csv.as_bytes(), &prod, &branches, &ComparePolicy::default())
            .await
            .expect("reconcile");
        assert_eq!(out.rows_read, 2);
        let records = &out.reconciliation.records;
        assert_eq!(records[0].product, "002");
        assert!(!records[0].has_diff);
        assert_eq!(records[1].product, "001");
        assert!(records[1].has_diff);
    }

    #[tokio::test]
    async fn unreachable_prod_fails_the_import() {
        let csv = "branch,product,location,total_value,average_cost\nA,1,01,1,1\n";
        let branches = BranchSet::new(["A"]).unwrap();
        let err = reconcile_upload(
            csv.as_bytes(),
            &UnreachableSource::new(Side::Prod),
            &branches,
            &ComparePolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::Source(SourceError::Connectivity { .. })));
    }
}
