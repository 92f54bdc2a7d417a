//! classics - Compel Classics pipeline orchestrator
//!
//! Exit codes: 0 success, 1 illegal state / validation / flagged, 2 budget
//! exceeded, 3 fatal stage failure or internal error.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classics_pipeline::error::common_exit_code;
use classics_pipeline::PipelineError;

mod cli;

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<PipelineError>() {
        return err.exit_code();
    }
    if let Some(err) = err.downcast_ref::<classics_common::Error>() {
        return common_exit_code(err);
    }
    3
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so --json output on stdout stays parseable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classics=info,classics_pipeline=info,classics_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = cli::Cli::parse();

    match cli::execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}
