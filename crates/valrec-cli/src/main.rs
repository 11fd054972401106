use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use valrec_engine::{apply, export, DiffStatus, EngineConfig, Reconciler, ReportFilter, Selection};
use valrec_web::format_br;

#[derive(Debug, Parser)]
#[command(name = "valrec")]
#[command(about = "SB2 inventory valuation reconciliation between test and prod")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTML report and export endpoints.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Build one snapshot and print its summary and totals.
    Reconcile(FilterArgs),
    /// Write the filtered comparison to a CSV or XLSX file.
    Export {
        #[arg(long, value_enum, default_value_t = Format::Xlsx)]
        format: Format,
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// all, diff or equal.
    #[arg(long, default_value = "all")]
    filter: DiffStatus,
    /// Comma-separated branch codes, or `all`.
    #[arg(long, default_value = "all")]
    branch: String,
    /// Comma-separated years, or `all`.
    #[arg(long, default_value = "all")]
    year: String,
}

impl FilterArgs {
    fn report_filter(&self) -> ReportFilter {
        ReportFilter {
            branches: Selection::parse(&self.branch),
            years: Selection::parse(&self.year),
            status: self.filter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Csv,
    Xlsx,
}

impl Format {
    fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("loading VALREC_* configuration")?;
    let reconciler = Arc::new(Reconciler::from_config(&config));

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(valrec_web::port_from_env);
            valrec_web::serve(reconciler, port).await?;
        }
        Commands::Reconcile(filters) => {
            let snapshot = reconciler.snapshot(false).await?;
            let precision = reconciler.policy().precision;
            let filtered = apply(&snapshot.records, &filters.report_filter());
            let stats = &snapshot.stats;
            println!(
                "reconcile complete: rows={} matched={} diffs={} prod_only={} duplicate_test={} duplicate_prod={} substitutions={} elapsed_ms={}",
                snapshot.records.len(),
                stats.matched,
                stats.diff_count,
                stats.prod_only,
                stats.duplicate_test_keys,
                stats.duplicate_prod_keys,
                snapshot.substitutions,
                snapshot.elapsed_ms,
            );
            let totals = &filtered.totals;
            println!("selected rows: {}", totals.count);
            println!(
                "total value: test={} prod={}",
                format_br(totals.test_total_value, precision),
                format_br(totals.prod_total_value, precision)
            );
            println!(
                "average cost: test={} prod={}",
                format_br(totals.test_average_cost, precision),
                format_br(totals.prod_average_cost, precision)
            );
        }
        Commands::Export {
            format,
            out,
            filters,
        } => {
            let filter = filters.report_filter();
            let snapshot = reconciler.snapshot(false).await?;
            let precision = reconciler.policy().precision;
            let filtered = apply(&snapshot.records, &filter);
            let path = out.unwrap_or_else(|| {
                PathBuf::from(export::export_file_name(
                    filter.status,
                    format.extension(),
                    Local::now(),
                ))
            });
            match format {
                Format::Csv => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    export::write_csv(
                        BufWriter::new(file),
                        &filtered.records,
                        &filtered.totals,
                        precision,
                    )?;
                }
                Format::Xlsx => {
                    let bytes =
                        export::write_xlsx(&filtered.records, &filtered.totals, precision)?;
                    std::fs::write(&path, bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                }
            }
            info!(rows = filtered.records.len(), path = %path.display(), "export written");
            println!("export complete: rows={} path={}", filtered.records.len(), path.display());
        }
    }

    Ok(())
}
