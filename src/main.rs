use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use salesscope::analysis::AnalysisReport;
use salesscope::config::{Config, LoggingConfig, CONFIG_ENV};
use salesscope::dialogue::{Answer, DialogueSessionManager, Question, SessionError, SessionId};
use salesscope::series::{ExogenousSeries, Granularity, SalesPoint};
use salesscope::App;

#[derive(Parser)]
#[command(
    name = "salesscope",
    about = "Sales anomaly detection with ranked causes and follow-up interviews",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct InputArgs {
    /// Sales points as a JSON array of {date, product_id, quantity}
    #[arg(long)]
    sales: PathBuf,

    /// Exogenous series as a JSON array of {series_id, kind, points}
    #[arg(long)]
    exogenous: Vec<PathBuf>,

    /// Bucket size: day, week or month
    #[arg(long, default_value = "day")]
    granularity: Granularity,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect anomalies and rank their likely causes
    Detect {
        #[command(flatten)]
        input: InputArgs,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Detect anomalies, then interview about each one on stdin
    Interview {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Manage follow-up tasks
    Followups {
        #[command(subcommand)]
        action: FollowupAction,
    },

    /// Manage the retrieval store
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum FollowupAction {
    /// List pending follow-ups
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Re-open every due follow-up once and interview on stdin
    Run,

    /// Keep polling for due follow-ups and interview on stdin as they come up
    Watch {
        /// Seconds between polls (defaults to followup.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Delete all records of one type
    Purge {
        /// Record type, e.g. anomaly_response or analysis_summary
        #[arg(long = "type")]
        record_type: String,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn run_analysis(app: &App, input: &InputArgs) -> Result<AnalysisReport> {
    let points: Vec<SalesPoint> = read_json(&input.sales)?;
    let mut exogenous: Vec<ExogenousSeries> = Vec::new();
    for path in &input.exogenous {
        exogenous.extend(read_json::<Vec<ExogenousSeries>>(path)?);
    }
    tracing::info!(points = points.len(), series = exogenous.len(), "Inputs loaded");
    app.analyze(points, exogenous, input.granularity).await
}

fn print_report(report: &AnalysisReport) {
    println!("\n=== salesscope: {} anomalies ({} buckets) ===", report.analyses.len(), report.granularity);
    for a in &report.analyses {
        println!("\n{}", a.anomaly.summary());
        if a.correlations.is_empty() {
            println!("  No correlated factors.");
        }
        for c in &a.correlations {
            println!("  #{} {}", c.rank, c.interpretation);
        }
        println!("  Hypotheses:");
        for h in &a.hypotheses {
            println!("   - [{:.2}] {}", h.confidence(), h.description);
        }
    }
    for f in &report.failures {
        println!("\n! {} ({}): {}", f.product_id, f.stage, f.error);
    }
    println!();
}

fn print_question(q: &Question) {
    println!("\n[turn {}] {}", q.turn, q.text);
    for (i, c) in q.choices.iter().enumerate() {
        println!("  {}. {}", i + 1, c);
    }
    if q.choices.is_empty() {
        println!("  (answer in your own words, empty line to skip)");
    } else {
        println!("  (pick a number or answer in your own words, empty line to skip)");
    }
}

fn parse_answer(q: &Question, line: &str) -> Answer {
    let line = line.trim();
    match line.parse::<usize>() {
        Ok(n) if n >= 1 && n <= q.choices.len() => Answer::choice(q.choices[n - 1].clone()),
        _ => Answer::free_text(line),
    }
}

/// Ask questions until the session finishes or the user skips.
async fn interview(
    sessions: &DialogueSessionManager,
    lines: &mut Lines<BufReader<Stdin>>,
    id: SessionId,
    first: Question,
) -> Result<()> {
    let mut question = Some(first);
    while let Some(q) = question.take() {
        print_question(&q);
        let line = lines.next_line().await?.unwrap_or_default();
        if line.trim().is_empty() {
            sessions.abandon(id).await?;
            close(sessions, id).await?;
            println!("Skipped.");
            return Ok(());
        }

        let outcome = match sessions.answer(id, parse_answer(&q, &line)).await {
            Ok(o) => o,
            Err(SessionError::External { source, .. }) => {
                tracing::warn!(session = %id, error = %source, "answer not stored remotely, retrying once");
                sessions.resume(id).await.with_context(|| {
                    format!("Answer for session {id} saved locally but not yet stored")
                })?
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.state.is_terminal() {
            // The follow-up loop may already have evicted it.
            let explanation = sessions.snapshot(id).await.ok().and_then(|s| s.explanation);
            println!(
                "\nSession {}: {}",
                outcome.state,
                explanation.as_deref().unwrap_or("no explanation recorded")
            );
            if !outcome.follow_ups.is_empty() {
                println!("Scheduled {} follow-ups:", outcome.follow_ups.len());
                for t in &outcome.follow_ups {
                    println!("  {} due {}", t.kind, t.due_at.format("%Y-%m-%d"));
                }
            }
            close(sessions, id).await?;
        }
        question = outcome.next_question;
    }
    Ok(())
}

async fn close(sessions: &DialogueSessionManager, id: SessionId) -> Result<()> {
    match sessions.close(id).await {
        Ok(()) | Err(SessionError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Detect { input, json } => {
            let app = App::open(config)?;
            let report = run_analysis(&app, &input).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Interview { input } => {
            let app = App::open(config)?;
            let report = run_analysis(&app, &input).await?;
            print_report(&report);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            for analysis in &report.analyses {
                println!("\n--- {} ---", analysis.anomaly.summary());
                let id = app.open_session(analysis).await;
                let first = app.sessions.start(id).await?;
                interview(&app.sessions, &mut lines, id, first).await?;
            }
        }
        Commands::Followups { action } => {
            let app = App::open(config)?;
            match action {
                FollowupAction::List { json } => {
                    let pending = app.scheduler.list_pending().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&pending)?);
                    } else if pending.is_empty() {
                        println!("No follow-ups pending.");
                    } else {
                        println!("{:<12} | {:<12} | {:<20} | Due", "Kind", "Date", "Product");
                        println!("{:-<12}-|-{:-<12}-|-{:-<20}-|-{:-<10}", "", "", "", "");
                        for t in pending {
                            println!(
                                "{:<12} | {:<12} | {:<20} | {}",
                                t.kind,
                                t.anomaly_ref.date,
                                t.anomaly_ref.product_id,
                                t.due_at.format("%Y-%m-%d")
                            );
                        }
                    }
                }
                FollowupAction::Run => {
                    let reopened =
                        salesscope::scheduler::run_once(&app.scheduler, &app.sessions, Utc::now()).await?;
                    if reopened.is_empty() {
                        println!("No follow-ups due.");
                    }
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    for r in reopened {
                        println!("\n--- {} follow-up for {} ---", r.task.kind, r.task.anomaly_ref);
                        interview(&app.sessions, &mut lines, r.session_id, r.question).await?;
                    }
                }
                FollowupAction::Watch { interval } => {
                    let secs = interval.unwrap_or(app.config.followup.poll_interval_secs).max(1);
                    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
                    let engine = tokio::spawn(salesscope::scheduler::run_followup_loop(
                        app.scheduler.clone(),
                        app.sessions.clone(),
                        Duration::from_secs(secs),
                        tx,
                    ));
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    loop {
                        tokio::select! {
                            Some(r) = rx.recv() => {
                                println!(
                                    "\n--- [{}] {} follow-up for {} ---",
                                    Utc::now().format("%Y-%m-%d %H:%M"),
                                    r.task.kind,
                                    r.task.anomaly_ref
                                );
                                // An unanswered follow-up keeps its claim and comes back once the lease runs out.
                                tokio::select! {
                                    res = interview(&app.sessions, &mut lines, r.session_id, r.question) => res?,
                                    _ = tokio::signal::ctrl_c() => {
                                        tracing::info!("Interrupted, stopping follow-up engine");
                                        break;
                                    }
                                }
                            }
                            _ = tokio::signal::ctrl_c() => {
                                tracing::info!("Interrupted, stopping follow-up engine");
                                break;
                            }
                        }
                    }
                    engine.abort();
                }
            }
        }
        Commands::Store { action } => match action {
            StoreAction::Purge { record_type } => {
                let app = App::open(config)?;
                let removed = app.purge(&record_type).await?;
                println!("Removed {} '{}' records.", removed, record_type);
            }
        },
    }

    Ok(())
}
