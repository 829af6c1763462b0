//! tether-job - job manager entry point
//!
//! Reads the job auth token from stdin, optionally daemonizes, then serves
//! the job socket until asked to exit.

#[cfg(unix)]
use std::sync::Arc;

#[cfg(unix)]
use tether_job::cli::Args;
#[cfg(unix)]
use tether_job::daemon::{
    daemon_log_path, daemonize, forward_signals, read_job_auth_token, signal_ready,
};
#[cfg(unix)]
use tether_job::{AccessVerifier, ConfigLoader, JobIdentity, JobListener, JobManager};
#[cfg(unix)]
use tether_utils::{init_logging_with_config, LogConfig, LogOutput};
use tether_utils::Result;

/// Job sockets are Unix domain sockets
#[cfg(not(unix))]
fn main() -> Result<()> {
    eprintln!("Error: tether-job needs Unix domain sockets");
    Err(tether_utils::TetherError::Unsupported("job socket".into()))
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = run(args).await {
        tracing::error!("tether-job error: {}", e);
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
async fn run(args: Args) -> Result<()> {
    let config = ConfigLoader::load_and_validate(args.config.as_deref())?;
    let verifier = AccessVerifier::from_base64(&args.public_key)?;
    let job_id = args.job_id.to_string();

    // stdin is only ours until daemonizing replaces it
    let job_auth_token = read_job_auth_token(
        std::io::BufReader::new(std::io::stdin()),
        config.rpc.token_read_timeout(),
    )
    .await?;

    if args.daemon {
        daemonize(&daemon_log_path(&config, &job_id))?;
    }

    let log_config = if args.daemon {
        LogConfig::job_manager(&job_id)
    } else {
        LogConfig {
            output: LogOutput::Stderr,
            ..LogConfig::job_manager(&job_id)
        }
    };
    init_logging_with_config(log_config)?;
    tracing::info!(job_id = %job_id, client_id = %args.client_id, daemon = args.daemon, "tether-job starting");

    let manager = JobManager::new(
        config,
        JobIdentity {
            client_id: args.client_id.to_string(),
            job_id,
            job_auth_token,
        },
        verifier,
    );

    let listener = JobListener::bind(&args.socket_path())?;
    if let Some(fd) = args.ready_fd {
        signal_ready(fd)?;
    }

    let signals = {
        let manager = Arc::clone(&manager);
        let daemonized = args.daemon;
        tokio::spawn(async move {
            if let Err(e) = forward_signals(manager, daemonized).await {
                tracing::warn!("signal forwarding unavailable: {}", e);
            }
        })
    };

    listener.run(Arc::clone(&manager)).await;
    signals.abort();

    if let Some(cmd) = manager.cmd() {
        if !cmd.has_exited() {
            tracing::info!("job manager exiting with the job still running");
        }
    }
    manager.stream().close();
    tracing::info!("tether-job exiting");
    Ok(())
}
