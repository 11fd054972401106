use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use valrec_core::{
    normalize, ComparePolicy, ComparisonRecord, CompositeKey, RawRecord, ReconcileStats,
    Reconciliation,
};

/// Join test rows against prod rows on (branch, product, location).
///
/// Emits exactly one record per test row, in test order. Keys missing on the
/// prod side are compared against zero. When the prod side repeats a key the
/// first occurrence wins and the repeat is counted.
pub fn reconcile(test: &[RawRecord], prod: &[RawRecord], policy: &ComparePolicy) -> Reconciliation {
    let mut stats = ReconcileStats {
        test_rows: test.len(),
        prod_rows: prod.len(),
        ..ReconcileStats::default()
    };

    let mut lookup: HashMap<CompositeKey, RawRecord> = HashMap::with_capacity(prod.len());
    for raw in prod {
        let row = normalize(raw);
        match lookup.entry(row.key()) {
            Entry::Occupied(_) => stats.duplicate_prod_keys += 1,
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }

    let mut seen_test = HashSet::with_capacity(test.len());
    let mut used_prod = HashSet::new();
    let mut records = Vec::with_capacity(test.len());
    for raw in test {
        let row = normalize(raw);
        let key = row.key();
        let counterpart = lookup.get(&key);
        if counterpart.is_some() {
            stats.matched += 1;
            used_prod.insert(key.clone());
        }
        let record = compare(&row, counterpart, policy);
        if record.has_diff {
            stats.diff_count += 1;
        }
        records.push(record);
        if !seen_test.insert(key) {
            stats.duplicate_test_keys += 1;
        }
    }
    stats.prod_only = lookup.len() - used_prod.len();

    Reconciliation { records, stats }
}

fn compare(test: &RawRecord, prod: Option<&RawRecord>, policy: &ComparePolicy) -> ComparisonRecord {
    let test_total_value = policy.round(test.total_value);
    let test_average_cost = policy.round(test.average_cost);
    let test_quantity = test.quantity.map(|q| policy.round(q));
    let test_movement_date = test.movement_date.clone().unwrap_or_default();

    let (prod_total_value, prod_average_cost, prod_quantity, prod_movement_date) = match prod {
        Some(p) => (
            policy.round(p.total_value),
            policy.round(p.average_cost),
            p.quantity.map(|q| policy.round(q)),
            p.movement_date.clone().unwrap_or_default(),
        ),
        None => (Decimal::ZERO, Decimal::ZERO, Some(Decimal::ZERO), String::new()),
    };

    let diff_total_value = policy.differs(test_total_value, prod_total_value);
    let diff_average_cost = policy.differs(test_average_cost, prod_average_cost);
    let diff_quantity = policy.differs(
        test_quantity.unwrap_or_default(),
        prod_quantity.unwrap_or_default(),
    );
    // A missing prod row has no date to disagree with.
    let diff_movement_date = prod.is_some() && test_movement_date != prod_movement_date;
    let has_diff = diff_total_value
        || diff_average_cost
        || (policy.compare_quantity && diff_quantity)
        || (policy.compare_movement_date && diff_movement_date);

    ComparisonRecord {
        branch: test.branch.clone(),
        product: test.product.clone(),
        location: test.location.clone(),
        test_total_value,
        test_average_cost,
        prod_total_value,
        prod_average_cost,
        test_quantity,
        prod_quantity,
        test_movement_date,
        prod_movement_date,
        prod_present: prod.is_some(),
        diff_total_value,
        diff_average_cost,
        diff_quantity,
        diff_movement_date,
        has_diff,
    }
}
