//! Axum + Askama report UI for the SB2 test/prod reconciliation.

use std::io::{self, Write};
use std::sync::Arc;

use askama::Template;
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use valrec_core::{ComparisonRecord, Snapshot};
use valrec_engine::export::{self, ExportError, CSV_CONTENT_TYPE, XLSX_CONTENT_TYPE};
use valrec_engine::{
    apply, paginate, CacheError, DiffStatus, ImportError, Reconciler, ReportFilter, Selection,
    Totals, PAGE_SIZE,
};

pub const CRATE_NAME: &str = "valrec-web";

pub const DEFAULT_PORT: u16 = 9901;

const STREAM_CHUNK: usize = 64 * 1024;
const STREAM_DEPTH: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReportQuery {
    page: Option<String>,
    filter: Option<String>,
    branch: Option<String>,
    year: Option<String>,
    reload: Option<String>,
}

impl ReportQuery {
    /// Unparseable page numbers fall back to the first page.
    fn page(&self) -> i64 {
        self.page
            .as_deref()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(1)
    }

    fn report_filter(&self) -> ReportFilter {
        ReportFilter {
            branches: Selection::parse(self.branch.as_deref().unwrap_or_default()),
            years: Selection::parse(self.year.as_deref().unwrap_or_default()),
            status: self
                .filter
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
        }
    }

    fn force_reload(&self) -> bool {
        self.reload.as_deref() == Some("1")
    }
}

#[derive(Debug, Clone)]
struct RowView {
    branch: String,
    product: String,
    location: String,
    test_total_value: String,
    test_average_cost: String,
    prod_total_value: String,
    prod_average_cost: String,
    test_quantity: String,
    prod_quantity: String,
    test_movement_date: String,
    prod_movement_date: String,
    prod_present: bool,
    diff_total_value: bool,
    diff_average_cost: bool,
    has_diff: bool,
}

#[derive(Debug, Clone)]
struct TotalsView {
    test_total_value: String,
    test_average_cost: String,
    prod_total_value: String,
    prod_average_cost: String,
    test_quantity: String,
    prod_quantity: String,
}

#[derive(Debug, Clone)]
struct OptionView {
    value: String,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    rows: Vec<RowView>,
    totals: TotalsView,
    last_update: String,
    filter: String,
    branch_query: String,
    year_query: String,
    branch_options: Vec<OptionView>,
    year_options: Vec<OptionView>,
    all_branches: bool,
    all_years: bool,
    page: usize,
    total_pages: usize,
    prev_page: usize,
    next_page: usize,
    total_items: usize,
    total_full: usize,
    diff_count: usize,
    prod_only: usize,
    duplicates: usize,
    substitutions: usize,
}

#[derive(Debug, Serialize)]
struct ReportJson<'a> {
    built_at: String,
    page: usize,
    total_pages: usize,
    total_items: usize,
    total_full: usize,
    totals: Totals,
    available_years: Vec<String>,
    records: &'a [&'a ComparisonRecord],
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/report", get(report_json_handler))
        .route("/api/years", get(years_handler))
        .route("/export/csv", get(export_csv_handler))
        .route("/export/xlsx", get(export_xlsx_handler))
        .route("/import", post(import_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(reconciler: Arc<Reconciler>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "report server listening");
    axum::serve(listener, app(AppState::new(reconciler))).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("VALREC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let snapshot = match state.reconciler.snapshot(query.force_reload()).await {
        Ok(snapshot) => snapshot,
        Err(err) => return cache_error(err),
    };
    let precision = state.reconciler.policy().precision;
    let filter = query.report_filter();
    let filtered = apply(&snapshot.records, &filter);
    let page = paginate(&filtered.records, query.page(), PAGE_SIZE);

    let branch_options = state
        .reconciler
        .branches()
        .codes()
        .iter()
        .map(|code| OptionView {
            selected: !filter.branches.is_all() && filter.branches.contains(code),
            value: code.clone(),
        })
        .collect();
    let year_options = snapshot
        .available_years()
        .into_iter()
        .map(|year| OptionView {
            selected: !filter.years.is_all() && filter.years.contains(&year),
            value: year,
        })
        .collect();

    render_html(IndexTemplate {
        rows: page.items.iter().map(|r| row_view(r, precision)).collect(),
        totals: totals_view(&filtered.totals, precision),
        last_update: snapshot
            .built_at
            .with_timezone(&Local)
            .format("%H:%M:%S")
            .to_string(),
        filter: filter.status.to_string(),
        branch_query: filter.branches.to_query(),
        year_query: filter.years.to_query(),
        branch_options,
        year_options,
        all_branches: filter.branches.is_all(),
        all_years: filter.years.is_all(),
        page: page.page,
        total_pages: page.total_pages,
        prev_page: page.page.saturating_sub(1).max(1),
        next_page: (page.page + 1).min(page.total_pages),
        total_items: page.total_items,
        total_full: snapshot.records.len(),
        diff_count: snapshot.stats.diff_count,
        prod_only: snapshot.stats.prod_only,
        duplicates: snapshot.stats.duplicate_test_keys + snapshot.stats.duplicate_prod_keys,
        substitutions: snapshot.substitutions,
    })
}

async fn report_json_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let snapshot = match state.reconciler.snapshot(query.force_reload()).await {
        Ok(snapshot) => snapshot,
        Err(err) => return cache_error(err),
    };
    let filtered = apply(&snapshot.records, &query.report_filter());
    let page = paginate(&filtered.records, query.page(), PAGE_SIZE);
    Json(ReportJson {
        built_at: snapshot.built_at.to_rfc3339(),
        page: page.page,
        total_pages: page.total_pages,
        total_items: page.total_items,
        total_full: snapshot.records.len(),
        totals: filtered.totals,
        available_years: snapshot.available_years(),
        records: page.items,
    })
    .into_response()
}

async fn years_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.snapshot(false).await {
        Ok(snapshot) => Json(snapshot.available_years()).into_response(),
        Err(err) => cache_error(err),
    }
}

async fn export_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let (snapshot, filter) = match export_input(&state, &query).await {
        Ok(input) => input,
        Err(resp) => return resp,
    };
    let precision = state.reconciler.policy().precision;
    let file_name = export::export_file_name(filter.status, "csv", Local::now());
    let body = stream_csv(move |out| {
        let filtered = apply(&snapshot.records, &filter);
        export::write_csv(out, &filtered.records, &filtered.totals, precision)
    });
    attachment(body, CSV_CONTENT_TYPE, &file_name)
}

async fn export_xlsx_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let (snapshot, filter) = match export_input(&state, &query).await {
        Ok(input) => input,
        Err(resp) => return resp,
    };
    let filtered = apply(&snapshot.records, &filter);
    match export::write_xlsx(
        &filtered.records,
        &filtered.totals,
        state.reconciler.policy().precision,
    ) {
        Ok(bytes) => attachment(
            Body::from(bytes),
            XLSX_CONTENT_TYPE,
            &export::export_file_name(filter.status, "xlsx", Local::now()),
        ),
        Err(err) => server_error(anyhow::Error::from(err)),
    }
}

/// Reconcile an uploaded CSV against prod and return the result as CSV.
async fn import_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let result = match state.reconciler.import(body.as_ref()).await {
        Ok(result) => result,
        Err(err @ (ImportError::Csv(_) | ImportError::MissingColumn(_))) => {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
        Err(ImportError::Source(err)) => return cache_error(CacheError::from(err)),
    };
    info!(
        rows = result.rows_read,
        diffs = result.reconciliation.stats.diff_count,
        substitutions = result.substitutions,
        "upload reconciled"
    );
    let precision = state.reconciler.policy().precision;
    let file_name = export::export_file_name(DiffStatus::All, "csv", Local::now())
        .replace("comparison", "import");
    let body = stream_csv(move |out| {
        let records = result.reconciliation.records.iter().collect::<Vec<_>>();
        let totals = Totals::of(records.iter().copied());
        export::write_csv(out, &records, &totals, precision)
    });
    attachment(body, CSV_CONTENT_TYPE, &file_name)
}

/// Run a CSV writer on the blocking pool and stream its output in chunks.
fn stream_csv<F>(produce: F) -> Body
where
    F: FnOnce(&mut ChannelWriter) -> Result<(), ExportError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx.clone(), STREAM_CHUNK);
        if let Err(err) = produce(&mut writer) {
            warn!(error = %err, "csv stream aborted");
            let _ = tx.blocking_send(Err(io::Error::other(err.to_string())));
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// `Write` adapter that hands fixed-size chunks to an async receiver.
///
/// Must be driven from a blocking thread.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Vec<u8>>>, chunk_size: usize) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download receiver dropped"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk_size {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}

async fn export_input(
    state: &AppState,
    query: &ReportQuery,
) -> Result<(Arc<Snapshot>, ReportFilter), Response> {
    let snapshot = state
        .reconciler
        .snapshot(false)
        .await
        .map_err(cache_error)?;
    Ok((snapshot, query.report_filter()))
}

fn attachment(body: Body, content_type: &'static str, file_name: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn row_view(record: &ComparisonRecord, precision: u32) -> RowView {
    let optional = |q: Option<Decimal>| q.map(|q| format_br(q, precision)).unwrap_or_default();
    RowView {
        branch: record.branch.clone(),
        product: record.product.clone(),
        location: record.location.clone(),
        test_total_value: format_br(record.test_total_value, precision),
        test_average_cost: format_br(record.test_average_cost, precision),
        prod_total_value: format_br(record.prod_total_value, precision),
        prod_average_cost: format_br(record.prod_average_cost, precision),
        test_quantity: optional(record.test_quantity),
        prod_quantity: optional(record.prod_quantity),
        test_movement_date: record.test_movement_date.clone(),
        prod_movement_date: record.prod_movement_date.clone(),
        prod_present: record.prod_present,
        diff_total_value: record.diff_total_value,
        diff_average_cost: record.diff_average_cost,
        has_diff: record.has_diff,
    }
}

fn totals_view(totals: &Totals, precision: u32) -> TotalsView {
    TotalsView {
        test_total_value: format_br(totals.test_total_value, precision),
        test_average_cost: format_br(totals.test_average_cost, precision),
        prod_total_value: format_br(totals.prod_total_value, precision),
        prod_average_cost: format_br(totals.prod_average_cost, precision),
        test_quantity: format_br(totals.test_quantity, precision),
        prod_quantity: format_br(totals.prod_quantity, precision),
    }
}

/// Brazilian display notation: `.` groups thousands, `,` separates decimals.
pub fn format_br(value: Decimal, decimals: u32) -> String {
    let rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    let dp = decimals as usize;
    let fixed = format!("{:.dp$}", rounded.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    if frac_part.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped},{frac_part}")
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn cache_error(err: CacheError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        format!("Replica unavailable: {err}"),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {}", err),
    )
        .into_response()
}
