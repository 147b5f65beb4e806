//! Grades engine (grades-engine) - Main entry point
//!
//! Reads newline-delimited JSON from stdin: trigger events (`{"type": ...}`)
//! and commands (`{"command": ...}`). Events emitted by the engine and command
//! results are written to stdout as JSON lines; logs go to stderr, or to the
//! file named by `[logging] file` in the config.
//!
//! With `--report <course>` the engine prints a JSON grade report and exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use grades_common::config::{load_config_or_default, open_log_file, RootFolderInitializer, RootFolderResolver};
use grades_common::db::init_database;
use grades_common::events::GradesEvent;
use grades_common::{CourseId, UsageKey, UserId};
use grades_engine::blocks::{load_outlines_from_dir, CourseOutline, InMemoryBlockProvider, InMemoryLearnerDirectory};
use grades_engine::models::ScoreSubmission;
use grades_engine::services::{OverrideRequest, ReadPolicy};
use grades_engine::GradesEngine;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for grades-engine
#[derive(Parser, Debug)]
#[command(name = "grades-engine")]
#[command(about = "Persistent grades engine")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, env = "GRADES_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of course outline JSON files
    #[arg(short, long)]
    outline_dir: Option<PathBuf>,

    /// JSON file of learner group memberships
    #[arg(short, long)]
    learners: Option<PathBuf>,

    /// Print the grade report of this course and exit
    #[arg(long, value_name = "COURSE")]
    report: Option<String>,
}

/// Stdin command
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    RecordScore(ScoreSubmission),
    ReplaceScore(ScoreSubmission),
    PublishOutline {
        outline: CourseOutline,
    },
    SetOverride(OverrideRequest),
    ClearOverride {
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
        #[serde(default)]
        requested_by: Option<UserId>,
    },
    ReadCourseGrade {
        user_id: UserId,
        course_id: CourseId,
        #[serde(default)]
        policy: ReadPolicy,
    },
    ReadSubsectionGrade {
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Event(GradesEvent),
    Command(Command),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_config_or_default(args.config.as_deref());

    // stdout carries events, so logs never go there
    let log_file = match &toml_config.logging.file {
        Some(path) => Some(
            open_log_file(path).with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => None,
    };
    let default_filter = format!("grades_engine={}", toml_config.logging.level);
    let stderr_layer = log_file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
    });
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(stderr_layer)
        .with(file_layer)
        .init();

    let root_folder = RootFolderResolver::new(args.root_folder.as_deref(), &toml_config).resolve();
    let mut initializer = RootFolderInitializer::new(root_folder);
    if let Some(file) = &toml_config.database_file {
        initializer = initializer.with_database_file(file.clone());
    }
    initializer
        .ensure_directory_exists()
        .context("Failed to create root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db = init_database(&initializer.database_path())
        .await
        .context("Failed to initialize database")?;

    let provider = match args.outline_dir.as_ref().or(toml_config.outline_dir.as_ref()) {
        Some(dir) => load_outlines_from_dir(dir)
            .await
            .with_context(|| format!("Failed to load outlines from {}", dir.display()))?,
        None => {
            warn!("No outline directory configured; starting without course content");
            InMemoryBlockProvider::new()
        }
    };
    let provider = Arc::new(provider);

    let learners = match &args.learners {
        Some(path) => InMemoryLearnerDirectory::load_from_file(path)
            .await
            .with_context(|| format!("Failed to load learners from {}", path.display()))?,
        None => InMemoryLearnerDirectory::new(),
    };

    let engine = GradesEngine::new(db, provider.clone(), Arc::new(learners))
        .await
        .context("Failed to build grades engine")?;

    if let Some(course) = args.report {
        let report = engine
            .generate_report(&CourseId::new(course))
            .await
            .context("Failed to generate report")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let printer_stop = CancellationToken::new();
    let printer = tokio::spawn(print_events(engine.subscribe(), printer_stop.clone()));

    engine.start().await.context("Failed to start grades engine")?;

    tokio::select! {
        result = read_stdin(&engine, &provider) => {
            result?;
            info!("Input closed; waiting for pending recomputes");
            engine.wait_idle().await;
        }
        _ = shutdown_signal() => {}
    }

    engine.shutdown().await;
    printer_stop.cancel();
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn read_stdin(engine: &GradesEngine, provider: &InMemoryBlockProvider) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let input: InputLine = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!(line = line_no, error = %e, "Ignoring unreadable input line");
                continue;
            }
        };

        if let Err(e) = handle_input(engine, provider, input).await {
            warn!(line = line_no, reason_code = e.reason_code(), error = %e, "Input rejected");
            print_json(&serde_json::json!({
                "type": "Error",
                "line": line_no,
                "reason_code": e.reason_code(),
                "message": e.to_string(),
            }));
        }
    }
    Ok(())
}

async fn handle_input(
    engine: &GradesEngine,
    provider: &InMemoryBlockProvider,
    input: InputLine,
) -> grades_engine::Result<()> {
    let command = match input {
        InputLine::Event(event) => return engine.handle_event(event).await,
        InputLine::Command(command) => command,
    };

    match command {
        Command::RecordScore(submission) => {
            engine.record_score(submission).await?;
        }
        Command::ReplaceScore(submission) => {
            engine.replace_score(submission).await?;
        }
        Command::PublishOutline { outline } => {
            let event = provider.publish(outline).await?;
            engine.handle_event(event).await?;
        }
        Command::SetOverride(request) => {
            engine.set_override(request).await?;
        }
        Command::ClearOverride {
            user_id,
            course_id,
            subsection_key,
            requested_by,
        } => {
            engine
                .clear_override(user_id, course_id, subsection_key, requested_by)
                .await?;
        }
        Command::ReadCourseGrade {
            user_id,
            course_id,
            policy,
        } => {
            let lookup = engine.read_course_grade(user_id, &course_id, policy).await?;
            print_json(&lookup);
        }
        Command::ReadSubsectionGrade {
            user_id,
            course_id,
            subsection_key,
        } => {
            let grade = engine
                .read_subsection_grade(user_id, &course_id, &subsection_key)
                .await?;
            print_json(&grade);
        }
    }
    Ok(())
}

/// Write emitted events to stdout until `stop`, then drain what is left
async fn print_events(mut rx: broadcast::Receiver<GradesEvent>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    if !event.is_trigger() {
                        print_json(&event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer lagged; events dropped from output");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }

    while let Ok(event) = rx.try_recv() {
        if !event.is_trigger() {
            print_json(&event);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
