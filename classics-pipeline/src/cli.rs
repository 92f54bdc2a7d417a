//! `classics` command surface

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use classics_common::config::{resolve_config_path, CONFIG_ENV_VAR};
use classics_common::human_time::{format_duration_secs, format_usd};
use classics_common::PipelineConfig;
use classics_pipeline::models::{Book, Issue, NewBook, Severity, StageName};
use classics_pipeline::workflow::Outcome;
use classics_pipeline::PipelineContext;

/// Orchestrates the Compel Classics book pipeline
#[derive(Parser, Debug)]
#[command(name = "classics")]
#[command(about = "Per-book state machine for the Compel Classics pipeline")]
#[command(version)]
pub struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, env = "CLASSICS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a source file as a new book (INGESTED)
    Register {
        /// Book id: lowercase letters, digits, '_' and '-'
        book: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        author: String,
        /// Path or URI of the source file
        #[arg(long)]
        source: String,
    },

    /// Advance a book through one stage
    Advance {
        book: String,
        stage: StageName,
        /// Re-run even if the artifact exists; required to resume a FAILED book
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },

    /// Advance a book through consecutive stages until it needs attention
    Run {
        book: String,
        #[arg(long)]
        json: bool,
    },

    /// Show what approving a book involves
    RequestApproval {
        book: String,
        #[arg(long)]
        json: bool,
    },

    /// Approve a book for paid generation
    Approve {
        book: String,
        #[arg(long)]
        approver: String,
    },

    /// Show one book
    Status {
        book: String,
        #[arg(long)]
        json: bool,
    },

    /// List books
    List {
        /// Include archived books
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },

    /// List issues for one book, or across all books
    Issues {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        book: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        unresolved: bool,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },

    /// Resolve an issue (one-way)
    Resolve {
        issue: i64,
        #[arg(long)]
        notes: String,
    },

    /// Record an issue found during manual review
    Flag {
        book: String,
        #[arg(long, default_value = "review")]
        step: String,
        #[arg(long = "type")]
        issue_type: String,
        #[arg(long)]
        severity: Severity,
        #[arg(long)]
        description: String,
    },

    /// Issue counts grouped by step and type
    Patterns {
        #[arg(long)]
        json: bool,
    },

    /// Processing log of one book
    History {
        book: String,
        #[arg(long)]
        json: bool,
    },

    /// Move a book to FAILED out of band
    Abort {
        book: String,
        #[arg(long)]
        reason: String,
    },

    /// List stale in-progress markers, or clear one after a crash
    Recover {
        /// Only markers older than this many minutes
        #[arg(long, default_value_t = 60)]
        older_than_mins: i64,
        /// Clear the marker of this book
        #[arg(long)]
        clear: Option<String>,
    },

    /// Hide a book from listings and refuse further advances
    Archive { book: String },

    /// Spend against the per-book ceiling
    Budget { book: Option<String> },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_book(book: &Book) {
    println!("{} ({})", book.id, book.title);
    if !book.author.is_empty() {
        println!("  author:   {}", book.author);
    }
    match (book.state.is_holding(), book.resume_state) {
        (true, Some(resume)) => println!("  state:    {} (resume from {})", book.state, resume),
        _ => println!("  state:    {}", book.state),
    }
    if let Some(step) = book.current_step {
        println!("  step:     {}", step);
    }
    println!("  progress: {:.1}%", book.progress_percentage);
    println!("  cost:     {}", format_usd(book.cost_usd));
    if let Some(marker) = &book.in_progress {
        println!("  running:  {} since {} (run {})", marker.stage, marker.since.to_rfc3339(), marker.token);
    }
    if let Some(archived_at) = book.archived_at {
        println!("  archived: {}", archived_at.to_rfc3339());
    }
    if !book.notes.is_empty() {
        println!("  notes:");
        for line in book.notes.lines() {
            println!("    {}", line);
        }
    }
}

fn print_issue(issue: &Issue) {
    let status = if issue.resolved { "resolved" } else { "open" };
    println!(
        "#{:<5} {:<8} {:<6} {:<18} {:<20} {}",
        issue.id, status, issue.severity, issue.book_id, format!("{}/{}", issue.step, issue.issue_type), issue.description
    );
    if let Some(notes) = &issue.resolution_notes {
        println!("        resolution: {}", notes);
    }
}

fn print_outcome(book_id: &str, stage: StageName, outcome: &Outcome) {
    match outcome {
        Outcome::Advanced { state } => println!("{} {}: advanced, now {}", book_id, stage, state),
        Outcome::AlreadyDone { state } => println!("{} {}: already done, {}", book_id, stage, state),
        Outcome::Flagged { state, reason } => println!("{} {}: {} ({})", book_id, stage, state, reason),
        Outcome::Failed { state, error } => println!("{} {}: {} ({})", book_id, stage, state, error),
        Outcome::Aborted { state } => println!("{} {}: aborted, book is {}", book_id, stage, state),
    }
}

#[derive(Serialize)]
struct RunStep<'a> {
    stage: StageName,
    #[serde(flatten)]
    outcome: &'a Outcome,
}

/// Execute the parsed command; returns the process exit code
pub async fn execute(cli: Cli) -> Result<u8> {
    let config_path = resolve_config_path(cli.config.as_deref(), CONFIG_ENV_VAR)?;
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let ctx = PipelineContext::from_config(config)
        .await
        .context("Failed to open the pipeline state store")?;
    let store = ctx.store();

    match cli.command {
        Commands::Register {
            book,
            title,
            author,
            source,
        } => {
            let book = store
                .create_book(&NewBook {
                    id: book,
                    title,
                    author,
                    source_path: source,
                })
                .await?;
            println!("registered {} ({})", book.id, book.state);
        }

        Commands::Advance {
            book,
            stage,
            force,
            json,
        } => {
            let outcome = ctx.runner().advance(&book, stage, force).await?;
            if json {
                print_json(&outcome)?;
            } else {
                print_outcome(&book, stage, &outcome);
            }
            return Ok(outcome.exit_code());
        }

        Commands::Run { book, json } => {
            let steps = ctx.runner().run(&book).await?;
            if json {
                let steps: Vec<RunStep> = steps
                    .iter()
                    .map(|(stage, outcome)| RunStep { stage: *stage, outcome })
                    .collect();
                print_json(&steps)?;
            } else if steps.is_empty() {
                let current = store.get_book(&book).await?;
                println!("{}: nothing to run ({})", book, current.state);
            } else {
                for (stage, outcome) in &steps {
                    print_outcome(&book, *stage, outcome);
                }
            }
            return Ok(steps.last().map(|(_, outcome)| outcome.exit_code()).unwrap_or(0));
        }

        Commands::RequestApproval { book, json } => {
            let request = ctx.approval_gate().request_approval(&book).await?;
            if json {
                print_json(&request)?;
            } else {
                println!("{} ({}) is {}", request.book_id, request.title, request.state);
                println!("  cost so far: {}", format_usd(request.cost_usd));
                println!(
                    "  unresolved: {} high, {} medium, {} low",
                    request.count(Severity::High),
                    request.count(Severity::Medium),
                    request.count(Severity::Low)
                );
                for issue in &request.unresolved {
                    print_issue(issue);
                }
                match &request.existing {
                    Some(approval) => println!(
                        "  already approved by {} at {}",
                        approval.approver_id,
                        approval.approved_at.to_rfc3339()
                    ),
                    None if request.can_approve() => println!("  ready for approval"),
                    None => println!("  cannot be approved yet"),
                }
            }
        }

        Commands::Approve { book, approver } => {
            let approval = ctx.approval_gate().approve(&book, &approver).await?;
            println!("{} approved by {}", approval.book_id, approval.approver_id);
        }

        Commands::Status { book, json } => {
            let book = store.get_book(&book).await?;
            if json {
                print_json(&book)?;
            } else {
                print_book(&book);
                let unresolved = store.list_unresolved_issues(Some(&book.id)).await?;
                println!("  unresolved issues: {}", unresolved.len());
            }
        }

        Commands::List { all, json } => {
            let books = store.list_books(all).await?;
            if json {
                print_json(&books)?;
            } else {
                for book in &books {
                    println!(
                        "{:<24} {:<11} {:>6.1}% {:>9}  {}",
                        book.id,
                        book.state.as_str(),
                        book.progress_percentage,
                        format_usd(book.cost_usd),
                        book.title
                    );
                }
            }
        }

        Commands::Issues {
            book,
            all: _,
            unresolved,
            limit,
            json,
        } => {
            let issues = match (book, unresolved) {
                (Some(book), unresolved) => ctx.issue_tracker().list_issues(&book, unresolved).await?,
                (None, true) => ctx.issue_tracker().list_unresolved(None).await?,
                (None, false) => ctx.issue_tracker().get_recent_issues(limit).await?,
            };
            let issues: Vec<Issue> = issues.into_iter().take(limit as usize).collect();
            if json {
                print_json(&issues)?;
            } else {
                for issue in &issues {
                    print_issue(issue);
                }
            }
        }

        Commands::Resolve { issue, notes } => {
            let issue = ctx.issue_tracker().resolve_issue(issue, &notes).await?;
            println!("resolved issue #{} ({})", issue.id, issue.book_id);
        }

        Commands::Flag {
            book,
            step,
            issue_type,
            severity,
            description,
        } => {
            let issue = ctx
                .issue_tracker()
                .log_issue(&book, &step, &issue_type, &description, severity)
                .await?;
            println!("logged issue #{} ({} {})", issue.id, issue.severity, issue.issue_type);
        }

        Commands::Patterns { json } => {
            let patterns = ctx.issue_tracker().get_issue_patterns().await?;
            if json {
                print_json(&patterns)?;
            } else {
                for pattern in &patterns {
                    println!(
                        "{:<20} {:<24} total {:>4}  unresolved {:>4}",
                        pattern.step, pattern.issue_type, pattern.total, pattern.unresolved
                    );
                }
            }
        }

        Commands::History { book, json } => {
            store.get_book(&book).await?;
            let entries = store.list_log_entries(&book).await?;
            if json {
                print_json(&entries)?;
            } else {
                for entry in &entries {
                    println!(
                        "{} {:<20} {:<8} {:>9}  {}",
                        entry.timestamp.to_rfc3339(),
                        entry.step,
                        entry.status,
                        format_duration_secs(entry.duration_seconds),
                        entry.message
                    );
                }
            }
        }

        Commands::Abort { book, reason } => {
            let book = store.abort_book(&book, &reason).await?;
            println!("{} aborted, now {}", book.id, book.state);
        }

        Commands::Recover {
            older_than_mins,
            clear,
        } => match clear {
            Some(book) => match store.clear_stale_marker(&book).await? {
                Some(marker) => println!("cleared {} marker for {} (run {})", marker.stage, book, marker.token),
                None => println!("{} has no stage in progress", book),
            },
            None => {
                let stale = store
                    .list_stale_markers(chrono::Duration::minutes(older_than_mins.max(0)))
                    .await?;
                for book in &stale {
                    if let Some(marker) = &book.in_progress {
                        println!(
                            "{:<24} {:<20} since {} (run {})",
                            book.id,
                            marker.stage.as_str(),
                            marker.since.to_rfc3339(),
                            marker.token
                        );
                    }
                }
            }
        },

        Commands::Archive { book } => {
            let book = store.archive_book(&book).await?;
            println!("{} archived", book.id);
        }

        Commands::Budget { book } => {
            let ledger = ctx.cost_ledger();
            println!("ceiling per book: {}", format_usd(ledger.ceiling()));
            match book {
                Some(book) => {
                    let current = store.get_book(&book).await?;
                    println!("{} spent:     {}", current.id, format_usd(current.cost_usd));
                    println!("{} remaining: {}", current.id, format_usd(ledger.remaining_budget(&book).await?));
                }
                None => println!("total spend:      {}", format_usd(ledger.total_spend().await?)),
            }
        }
    }

    Ok(0)
}
