/*
 * main.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postbridge, a POP3-to-SMTP mail forwarder.
 *
 * Postbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postbridge.  If not, see <http://www.gnu.org/licenses/>.
 */


//! postbridge: one fetch, dedupe and forward cycle over every configured mailbox.
//! Meant to be re-run by an external scheduler (cron, systemd timer).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgEnum, Parser};
use tracing_subscriber::EnvFilter;

use postbridge_core::config::DEFAULT_LOG_LEVEL;
use postbridge_core::protocol::pop3::Pop3Source;
use postbridge_core::protocol::smtp::SmtpForwarder;
use postbridge_core::{Config, HistoryStore, MailboxOutcome, Pipeline, RunSummary};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(
        short,
        long,
        env = "POSTBRIDGE_CONFIG",
        default_value = "/etc/postbridge/config.xml"
    )]
    /// Path to the XML configuration file
    config: PathBuf,

    #[clap(long, arg_enum, default_value = "json")]
    /// Log output format
    log_format: LogFormat,
}

#[derive(ArgEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

/// RUST_LOG, when set, takes precedence over the configured level.
fn tracer(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))
    {
        Ok(config) => config,
        Err(e) => {
            tracer(args.log_format, DEFAULT_LOG_LEVEL);
            tracing::error!(error = %format!("{:#}", e), "startup failed");
            return ExitCode::FAILURE;
        }
    };
    tracer(args.log_format, &config.log_level);
    for element in &config.ignored {
        tracing::warn!(element = %element, "ignoring unknown configuration element");
    }

    match run(config).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            tracing::error!(
                forwarded = summary.forwarded,
                errors = summary.errors,
                "run finished with errors"
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<RunSummary> {
    let history = HistoryStore::load(&config.state_path)
        .with_context(|| format!("loading history from {}", config.state_path.display()))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mailboxes = config.mailboxes.len(),
        destination = %config.destination.address,
        state = %config.state_path.display(),
        "starting run"
    );

    let source = Pop3Source::new(config.timeout);
    let forwarder = SmtpForwarder::new(config.destination.clone(), config.timeout);
    let pipeline = Pipeline::new(&source, &forwarder, &history, &config.destination.address);
    let summary = pipeline.run(&config.mailboxes).await;

    for report in &summary.mailboxes {
        match &report.outcome {
            MailboxOutcome::Completed => tracing::info!(
                mailbox = %report.address,
                forwarded = report.forwarded,
                skipped = report.skipped,
                errors = report.errors,
                "mailbox summary"
            ),
            MailboxOutcome::Aborted { stage, reason } => tracing::warn!(
                mailbox = %report.address,
                stage = %stage,
                reason = %reason,
                "mailbox summary: aborted"
            ),
        }
    }
    Ok(summary)
}
