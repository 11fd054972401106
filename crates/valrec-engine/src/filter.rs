use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use valrec_core::ComparisonRecord;

/// Rows per report page.
pub const PAGE_SIZE: usize = 100;

const ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    #[default]
    All,
    Diff,
    Equal,
}

impl DiffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Diff => "diff",
            Self::Equal => "equal",
        }
    }

    fn matches(&self, record: &ComparisonRecord) -> bool {
        match self {
            Self::All => true,
            Self::Diff => record.has_diff,
            Self::Equal => !record.has_diff,
        }
    }
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | ALL => Ok(Self::All),
            "diff" => Ok(Self::Diff),
            "equal" => Ok(Self::Equal),
            other => Err(format!("unknown diff status: {other}")),
        }
    }
}

/// Either every value (the `all` sentinel) or an explicit set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl Selection {
    /// Parse a comma-separated list; empty input or any `all` entry selects everything.
    pub fn parse(input: &str) -> Self {
        let values = input
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>();
        if values.is_empty() || values.iter().any(|v| v.eq_ignore_ascii_case(ALL)) {
            return Self::All;
        }
        Self::Only(values.into_iter().map(ToString::to_string).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(values) => values.contains(value),
        }
    }

    /// Query-string form, `all` for the sentinel.
    pub fn to_query(&self) -> String {
        match self {
            Self::All => ALL.to_string(),
            Self::Only(values) => values.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportFilter {
    pub branches: Selection,
    pub years: Selection,
    pub status: DiffStatus,
}

impl ReportFilter {
    fn matches_branch(&self, record: &ComparisonRecord) -> bool {
        self.branches.contains(&record.branch)
    }

    /// Keeps a record when either side's year is selected. With a concrete year
    /// selection, a record without any date never matches.
    fn matches_year(&self, record: &ComparisonRecord) -> bool {
        self.years.is_all() || record.years().any(|y| self.years.contains(y))
    }

    pub fn matches(&self, record: &ComparisonRecord) -> bool {
        self.matches_branch(record) && self.matches_year(record) && self.status.matches(record)
    }
}

/// Column sums over a set of records. Exact decimal arithmetic, so summing
/// per-page totals gives the same result as summing the whole set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub count: usize,
    pub test_total_value: Decimal,
    pub test_average_cost: Decimal,
    pub prod_total_value: Decimal,
    pub prod_average_cost: Decimal,
    pub test_quantity: Decimal,
    pub prod_quantity: Decimal,
}

impl Totals {
    pub fn add(&mut self, record: &ComparisonRecord) {
        self.count += 1;
        self.test_total_value += record.test_total_value;
        self.test_average_cost += record.test_average_cost;
        self.prod_total_value += record.prod_total_value;
        self.prod_average_cost += record.prod_average_cost;
        self.test_quantity += record.test_quantity.unwrap_or_default();
        self.prod_quantity += record.prod_quantity.unwrap_or_default();
    }

    pub fn merge(&mut self, other: &Totals) {
        self.count += other.count;
        self.test_total_value += other.test_total_value;
        self.test_average_cost += other.test_average_cost;
        self.prod_total_value += other.prod_total_value;
        self.prod_average_cost += other.prod_average_cost;
        self.test_quantity += other.test_quantity;
        self.prod_quantity += other.prod_quantity;
    }

    pub fn of<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ComparisonRecord>,
    {
        let mut totals = Self::default();
        for record in records {
            totals.add(record);
        }
        totals
    }
}

#[derive(Debug, Clone)]
pub struct Filtered<'a> {
    pub records: Vec<&'a ComparisonRecord>,
    pub totals: Totals,
}

/// Apply branch, then year, then diff-status selection and total the survivors.
pub fn apply<'a>(records: &'a [ComparisonRecord], filter: &ReportFilter) -> Filtered<'a> {
    let records = records
        .iter()
        .filter(|r| filter.matches_branch(r))
        .filter(|r| filter.matches_year(r))
        .filter(|r| filter.status.matches(r))
        .collect::<Vec<_>>();
    let totals = Totals::of(records.iter().copied());
    Filtered { records, totals }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<'a, T> {
    pub items: &'a [T],
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// Slice out one page, clamping the requested number into `1..=total_pages`.
/// An empty input still has one (empty) page.
pub fn paginate<T>(items: &[T], requested: i64, page_size: usize) -> Page<'_, T> {
    let page_size = page_size.max(1);
    let total_pages = items.len().max(1).div_ceil(page_size);
    let page = requested.clamp(1, total_pages as i64) as usize;
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(items.len());
    Page {
        items: &items[start.min(end)..end],
        page,
        total_pages,
        total_items: items.len(),
    }
}
