//! Command-line arguments for the `tether-job` binary

use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

use crate::auth::PUBLIC_KEY_ENV_VAR;

/// tether-job - run one PTY job that outlives its main server
///
/// Reads `Tether-JobAuthToken:<token>` from stdin, then listens on the job
/// socket for main servers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Job id
    #[arg(long)]
    pub job_id: Uuid,

    /// Id of the client that owns the job
    #[arg(long)]
    pub client_id: Uuid,

    /// Socket path (defaults to the per-job path under the runtime dir)
    #[arg(long, short = 'S')]
    pub socket: Option<PathBuf>,

    /// Config file (defaults to the user config file)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and redirect stdio to the job log
    #[arg(long, default_value_t = false)]
    pub daemon: bool,

    /// File descriptor to write `ready` to once the socket is listening
    #[arg(long)]
    pub ready_fd: Option<i32>,

    /// Base64 Ed25519 key that main-server tokens are signed with
    #[arg(long, env = PUBLIC_KEY_ENV_VAR, hide_env_values = true)]
    pub public_key: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Socket to listen on
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(|| {
            tether_utils::job_socket_path(&self.client_id.to_string(), &self.job_id.to_string())
        })
    }
}
