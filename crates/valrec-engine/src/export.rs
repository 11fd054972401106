//! Streaming CSV and XLSX writers for a filtered comparison.

use std::io::Write;

use chrono::{DateTime, Local};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, XlsxError};
use thiserror::Error;
use valrec_core::ComparisonRecord;

use crate::filter::{DiffStatus, Totals};

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

const SHEET_NAME: &str = "SB2 comparison";

const HEADERS: [&str; 12] = [
    "BRANCH",
    "PRODUCT",
    "LOCATION",
    "TEST_TOTAL_VALUE",
    "TEST_AVERAGE_COST",
    "PROD_TOTAL_VALUE",
    "PROD_AVERAGE_COST",
    "TEST_QUANTITY",
    "PROD_QUANTITY",
    "TEST_MOVEMENT_DATE",
    "PROD_MOVEMENT_DATE",
    "HAS_DIFF",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("xlsx write failed: {0}")]
    Xlsx(#[from] XlsxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Download name, e.g. `comparison_sb2_diff_20240131_0915.xlsx`.
pub fn export_file_name(status: DiffStatus, extension: &str, now: DateTime<Local>) -> String {
    let label = match status {
        DiffStatus::All => String::new(),
        other => format!("_{other}"),
    };
    format!(
        "comparison_sb2{label}_{}.{extension}",
        now.format("%Y%m%d_%H%M")
    )
}

/// Write records row by row, followed by a `TOTAL` row.
pub fn write_csv<W: Write>(
    writer: W,
    records: &[&ComparisonRecord],
    totals: &Totals,
    precision: u32,
) -> Result<(), ExportError> {
    let dp = precision as usize;
    let mut out = csv::WriterBuilder::new().from_writer(writer);
    out.write_record(HEADERS)?;

    for record in records {
        out.write_record([
            record.branch.clone(),
            record.product.clone(),
            record.location.clone(),
            fixed(record.test_total_value, dp),
            fixed(record.test_average_cost, dp),
            fixed(record.prod_total_value, dp),
            fixed(record.prod_average_cost, dp),
            record.test_quantity.map(|q| fixed(q, dp)).unwrap_or_default(),
            record.prod_quantity.map(|q| fixed(q, dp)).unwrap_or_default(),
            record.test_movement_date.clone(),
            record.prod_movement_date.clone(),
            if record.has_diff { "1" } else { "0" }.to_string(),
        ])?;
    }

    out.write_record([
        "TOTAL".to_string(),
        String::new(),
        String::new(),
        fixed(totals.test_total_value, dp),
        fixed(totals.test_average_cost, dp),
        fixed(totals.prod_total_value, dp),
        fixed(totals.prod_average_cost, dp),
        fixed(totals.test_quantity, dp),
        fixed(totals.prod_quantity, dp),
        String::new(),
        String::new(),
        String::new(),
    ])?;
    out.flush()?;
    Ok(())
}

/// Build a workbook in constant-memory mode: rows are flushed as they are
/// written, so only the current row is held in memory.
pub fn write_xlsx(
    records: &[&ComparisonRecord],
    totals: &Totals,
    precision: u32,
) -> Result<Vec<u8>, ExportError> {
    let num_format = number_format(precision);
    let header_fmt = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x0B1220))
        .set_align(FormatAlign::Center);
    let normal_fmt = Format::new().set_num_format(&num_format);
    let diff_fmt = Format::new()
        .set_bold()
        .set_font_color(Color::RGB(0xFF0000))
        .set_num_format(&num_format);
    let total_fmt = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xE1E1E1))
        .set_num_format(&num_format)
        .set_border_top(FormatBorder::Thin);

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet_with_constant_memory();
    sheet.set_name(SHEET_NAME)?;
    sheet.set_column_width(0, 10)?;
    sheet.set_column_width(1, 20)?;
    sheet.set_column_width(2, 10)?;
    for col in 3..=8 {
        sheet.set_column_width(col, 18)?;
    }
    sheet.set_column_width(9, 14)?;
    sheet.set_column_width(10, 14)?;

    for (col, header) in HEADERS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &header_fmt)?;
    }

    let mut row = 0u32;
    for record in records {
        row += 1;
        sheet.write_string(row, 0, &record.branch)?;
        sheet.write_string(row, 1, &record.product)?;
        sheet.write_string(row, 2, &record.location)?;
        sheet.write_number_with_format(row, 3, as_f64(record.test_total_value), &normal_fmt)?;
        sheet.write_number_with_format(row, 4, as_f64(record.test_average_cost), &normal_fmt)?;
        let total_fmt_for_row = if record.diff_total_value { &diff_fmt } else { &normal_fmt };
        let cost_fmt_for_row = if record.diff_average_cost { &diff_fmt } else { &normal_fmt };
        sheet.write_number_with_format(row, 5, as_f64(record.prod_total_value), total_fmt_for_row)?;
        sheet.write_number_with_format(row, 6, as_f64(record.prod_average_cost), cost_fmt_for_row)?;
        if let Some(q) = record.test_quantity {
            sheet.write_number_with_format(row, 7, as_f64(q), &normal_fmt)?;
        }
        if let Some(q) = record.prod_quantity {
            sheet.write_number_with_format(row, 8, as_f64(q), &normal_fmt)?;
        }
        sheet.write_string(row, 9, &record.test_movement_date)?;
        sheet.write_string(row, 10, &record.prod_movement_date)?;
        sheet.write_boolean(row, 11, record.has_diff)?;
    }

    let last = row + 1;
    sheet.write_string_with_format(last, 0, "TOTAL", &total_fmt)?;
    sheet.write_string_with_format(last, 1, "", &total_fmt)?;
    sheet.write_string_with_format(last, 2, "", &total_fmt)?;
    let sums = [
        totals.test_total_value,
        totals.test_average_cost,
        totals.prod_total_value,
        totals.prod_average_cost,
        totals.test_quantity,
        totals.prod_quantity,
    ];
    for (offset, value) in sums.into_iter().enumerate() {
        sheet.write_number_with_format(last, 3 + offset as u16, as_f64(value), &total_fmt)?;
    }

    Ok(workbook.save_to_buffer()?)
}

fn fixed(value: Decimal, dp: usize) -> String {
    let value = value.round_dp_with_strategy(dp as u32, RoundingStrategy::MidpointAwayFromZero);
    format!("{value:.dp$}")
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn number_format(precision: u32) -> String {
    if precision == 0 {
        "0".to_string()
    } else {
        format!("0.{}", "0".repeat(precision as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn record(product: &str, a: &str, has_diff: bool) -> ComparisonRecord {
        let value = Decimal::from_str(a).unwrap();
        ComparisonRecord {
            branch: "09ALFA01".into(),
            product: product.into(),
            location: "01".into(),
            test_total_value: value,
            test_average_cost: Decimal::ONE,
            prod_total_value: if has_diff { Decimal::ZERO } else { value },
            prod_average_cost: Decimal::ONE,
            test_quantity: Some(Decimal::from(3)),
            prod_quantity: None,
            test_movement_date: "20240101".into(),
            prod_movement_date: String::new(),
            prod_present: !has_diff,
            diff_total_value: has_diff,
            diff_average_cost: false,
            diff_quantity: false,
            diff_movement_date: true,
            has_diff,
        }
    }

    #[test]
    fn file_name_carries_filter_and_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 1, 31, 9, 15, 0).single().unwrap();
        assert_eq!(
            export_file_name(DiffStatus::All, "xlsx", now),
            "comparison_sb2_20240131_0915.xlsx"
        );
        assert_eq!(
            export_file_name(DiffStatus::Diff, "csv", now),
            "comparison_sb2_diff_20240131_0915.csv"
        );
    }

    #[test]
    fn csv_has_header_rows_and_total_line() {
        let records = vec![record("001", "10.5", true), record("002", "2.25", false)];
        let refs = records.iter().collect::<Vec<_>>();
        let totals = Totals::of(refs.iter().copied());
        let mut buf = Vec::new();
        write_csv(&mut buf, &refs, &totals, 2).expect("csv");
        let text = String::from_utf8(buf).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("BRANCH,PRODUCT,LOCATION"));
        assert_eq!(
            lines[1],
            "09ALFA01,001,01,10.50,1.00,0.00,1.00,3.00,,20240101,,1"
        );
        assert_eq!(lines[3], "TOTAL,,,12.75,2.00,2.25,2.00,6.00,0.00,,,");
    }

    #[test]
    fn xlsx_export_produces_a_zip_container() {
        let records = vec![record("001", "10.5", true)];
        let refs = records.iter().collect::<Vec<_>>();
        let totals = Totals::of(refs.iter().copied());
        let bytes = write_xlsx(&refs, &totals, 6).expect("xlsx");
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn csv_export_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let file = std::fs::File::create(&path).expect("create");
        write_csv(file, &[], &Totals::default(), 6).expect("csv");
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("TOTAL,,,0.000000"));
    }

    #[test]
    fn number_format_matches_precision() {
        assert_eq!(number_format(0), "0");
        assert_eq!(number_format(2), "0.00");
        assert_eq!(number_format(6), "0.000000");
    }
}
