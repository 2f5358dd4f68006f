use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use student_risk_analytics::annotation::GeminiAnnotator;
use student_risk_analytics::export::{CsvSink, RunContext};
use student_risk_analytics::report::{self, ReportSink};
use student_risk_analytics::sheets::SheetsSink;
use student_risk_analytics::{ingest, logging, score_batch, Config, RunStatus, Workflow};

#[derive(Parser)]
#[command(name = "student-risk")]
#[command(about = "Academic risk scoring for student performance records", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a batch and list the highest-risk students
    Score {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the full workflow: score, annotate, export, alert
    Run {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
        /// Skip the external reasoning step
        #[arg(long)]
        no_ai: bool,
        /// Skip the spreadsheet export
        #[arg(long)]
        no_sheets: bool,
        /// Skip the markdown report
        #[arg(long)]
        no_report: bool,
    },
    /// Generate a markdown report from deterministic scores
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Print the High-risk subset as JSON
    HighRisk {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
    },
}

fn delimiter_byte(delimiter: char) -> anyhow::Result<u8> {
    u8::try_from(delimiter).context("delimiter must be a single ASCII character")
}

fn load_scored(
    config: &Config,
    csv: &Path,
    delimiter: char,
) -> anyhow::Result<student_risk_analytics::ScoredBatch> {
    let records = ingest::read_records(csv, delimiter_byte(delimiter)?)
        .with_context(|| format!("failed to load {}", csv.display()))?;
    let aggregator = student_risk_analytics::RiskAggregator::new(config.weights, config.thresholds)?;
    Ok(score_batch(&records, &aggregator)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.log);

    match cli.command {
        Commands::Score {
            csv,
            delimiter,
            limit,
        } => {
            let batch = load_scored(&config, &csv, delimiter)?;
            println!("Top students by risk score:");
            for student in batch.ranked().into_iter().take(limit) {
                println!(
                    "- student {} score {:.2} ({}) attendance {:.1}%, grade {}, trend {:+}",
                    student.student_id,
                    student.assessment.risk_score,
                    student.assessment.risk_level,
                    student.features.attendance_pct,
                    student.features.final_grade,
                    student.features.trend_recent
                );
            }
        }
        Commands::Run {
            csv,
            delimiter,
            no_ai,
            no_sheets,
            no_report,
        } => {
            if no_ai {
                config.annotation.enabled = false;
            }
            if no_sheets {
                config.sheets.enabled = false;
            }
            if no_report {
                config.output.report = false;
            }

            let stop = Arc::new(AtomicBool::new(false));
            let signal_flag = Arc::clone(&stop);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, no further annotation calls will be issued");
                    signal_flag.store(true, Ordering::Relaxed);
                }
            });

            let mut workflow = Workflow::new(config.clone())?
                .with_stop_flag(stop)
                .with_sink(Box::new(CsvSink::new(&config.output.output_dir)));

            if config.annotation.enabled {
                match GeminiAnnotator::new(config.annotation.clone()) {
                    Ok(annotator) => workflow = workflow.with_annotator(Arc::new(annotator)),
                    Err(err) => {
                        warn!(error = %err, "annotation disabled, using deterministic scores")
                    }
                }
            }
            if config.sheets.enabled {
                workflow = workflow.with_sink(Box::new(SheetsSink::new(config.sheets.clone())?));
            }
            if config.output.report {
                workflow =
                    workflow.with_sink(Box::new(ReportSink::new(&config.output.output_dir, 10)));
            }

            let summary = workflow.run_file(&csv, delimiter_byte(delimiter)?).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == RunStatus::Failed {
                anyhow::bail!(
                    "workflow failed: {}",
                    summary.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Commands::Report {
            csv,
            delimiter,
            out,
        } => {
            let batch = load_scored(&config, &csv, delimiter)?;
            let report = report::build_report(&batch, &RunContext::new(), 10);
            std::fs::write(&out, report)?;
            info!(path = %out.display(), "report written");
            println!("Report written to {}.", out.display());
        }
        Commands::HighRisk { csv, delimiter } => {
            let batch = load_scored(&config, &csv, delimiter)?;
            println!("{}", serde_json::to_string_pretty(&batch.high_risk())?);
        }
    }

    Ok(())
}
