//! vplay: resolve remote videos and prepare them for playback.

mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vplay_media::{
    CancellationToken, MediaConfig, MediaError, PlaybackMode, PlaybackService, ProcessExecutor,
};
use vplay_models::{extract_identifier, parse_expiry, trim_url};

use crate::logging::{init_tracing, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "vplay", version, about = "Resolve and prepare remote videos for playback")]
struct Cli {
    /// Overall deadline for the command in seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print resolved metadata as JSON
    Resolve {
        url: String,
    },

    /// Resolve and produce a playable URL or local file
    Prepare {
        url: String,

        /// `stream` returns the remote URL, `local` remuxes to a file
        #[arg(short, long, default_value = "stream")]
        mode: PlaybackMode,
    },

    /// Show how a URL is normalised without running any tool
    Inspect {
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing(LogFormat::from_env());

    let cli = Cli::parse();
    let config = MediaConfig::from_env();
    info!(?config, "Starting vplay");

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(cancel.clone(), cli.deadline_secs.map(Duration::from_secs));

    match run(cli.command, &config, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(command: Commands, config: &MediaConfig, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { url } => {
            let report = serde_json::json!({
                "trimmed": trim_url(&url),
                "identifier": extract_identifier(&url).map(|id| id.to_string()),
                "expires_at": parse_expiry(&url).map(|at| at.to_rfc3339()),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Resolve { url } => {
            let service = PlaybackService::from_config(Arc::new(ProcessExecutor::from_config(config)), config);
            let metadata = service
                .metadata_cache()
                .resolve(&url, cancel)
                .await
                .with_context(|| format!("Failed to resolve {}", url))?;
            println!("{}", serde_json::to_string_pretty(metadata.as_ref())?);
        }
        Commands::Prepare { url, mode } => {
            let service = PlaybackService::from_config(Arc::new(ProcessExecutor::from_config(config)), config);
            let ready = service.prepare_in_background(url.clone(), mode, cancel.clone());
            let source = ready
                .await
                .context("Preparation task ended without a result")?
                .with_context(|| format!("Failed to prepare {}", url))?;

            let report = serde_json::json!({
                "mode": mode.as_str(),
                "location": source.location(),
                "title": source.metadata().title,
                "duration_secs": source.metadata().duration_secs,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// Cancel on Ctrl-C or when the overall deadline passes.
fn spawn_cancel_triggers(cancel: CancellationToken, deadline: Option<Duration>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    warn!(deadline_secs = deadline.as_secs(), "Deadline reached, cancelling");
                    cancel.cancel();
                }
            }
        });
    }
}

/// 130 for cancellation, 124 for timeouts, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MediaError>() {
        Some(MediaError::Cancelled) => 130,
        Some(MediaError::Timeout(_)) => 124,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_prepare() {
        let cli = Cli::parse_from([
            "vplay",
            "--deadline-secs",
            "30",
            "prepare",
            "https://youtu.be/x",
            "-m",
            "local",
        ]);
        assert_eq!(cli.deadline_secs, Some(30));
        match cli.command {
            Commands::Prepare { url, mode } => {
                assert_eq!(url, "https://youtu.be/x");
                assert_eq!(mode, PlaybackMode::Local);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_exit_codes() {
        let cancelled = anyhow::Error::new(MediaError::Cancelled).context("Failed to prepare");
        assert_eq!(exit_code_for(&cancelled), 130);

        let timeout = anyhow::Error::new(MediaError::Timeout(Duration::from_secs(1)));
        assert_eq!(exit_code_for(&timeout), 124);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[tokio::test]
    async fn test_inspect_runs_without_tools() {
        let cancel = CancellationToken::new();
        run(
            Commands::Inspect {
                url: "https://youtu.be/dQw4w9WgXcQ?si=x".to_string(),
            },
            &MediaConfig::default(),
            &cancel,
        )
        .await
        .unwrap();
    }
}
