//! Path utilities for tether
//!
//! Handles XDG Base Directory locations for config, state and runtime files,
//! plus the deterministic per-job socket layout.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "tether";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/tether` or `/tmp/tether-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Directory holding one subdirectory of job sockets per client
pub fn jobs_dir() -> PathBuf {
    runtime_dir().join("jobs")
}

/// Socket path for a job manager
///
/// Location: `<runtime>/jobs/<client_id>/<job_id>.sock`. A main server that
/// restarts can find a running job from the two ids alone.
pub fn job_socket_path(client_id: &str, job_id: &str) -> PathBuf {
    jobs_dir().join(client_id).join(format!("{}.sock", job_id))
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(fallback_config_dir)
}

/// Get the main configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/tether` or `~/.local/state/tether`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(fallback_state_dir)
}

/// Get the log directory
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Ensure a directory exists and is accessible only by its owner
pub fn ensure_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    ensure_dir(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn fallback_config_dir() -> PathBuf {
    home_dir().join(".config").join(APP_NAME)
}

fn fallback_state_dir() -> PathBuf {
    home_dir().join(".local").join("state").join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::os::unix::fs::PermissionsExt;

    // ==================== Runtime Dir Tests ====================

    #[test]
    fn test_runtime_dir_contains_tether() {
        let path = runtime_dir();
        assert!(path.to_string_lossy().contains("tether"));
    }

    #[test]
    fn test_runtime_dir_xdg_and_fallback() {
        let original = env::var("XDG_RUNTIME_DIR").ok();

        env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        assert_eq!(runtime_dir(), PathBuf::from("/run/user/1000/tether"));

        env::remove_var("XDG_RUNTIME_DIR");
        let path = runtime_dir();
        assert!(path.to_string_lossy().starts_with("/tmp/tether-"));

        if let Some(val) = original {
            env::set_var("XDG_RUNTIME_DIR", val);
        }
    }

    // ==================== Job Socket Tests ====================

    #[test]
    fn test_job_socket_path_layout() {
        let path = job_socket_path("client-a", "job-b");
        assert!(path.ends_with("jobs/client-a/job-b.sock"));
    }

    #[test]
    fn test_job_socket_path_is_deterministic() {
        assert_eq!(job_socket_path("c", "j"), job_socket_path("c", "j"));
        assert_ne!(job_socket_path("c", "j1"), job_socket_path("c", "j2"));
        assert_ne!(job_socket_path("c1", "j"), job_socket_path("c2", "j"));
    }

    // ==================== Config/State Tests ====================

    #[test]
    fn test_config_file_name() {
        let path = config_file();
        assert_eq!(path.file_name().unwrap(), "config.toml");
        assert!(path.starts_with(config_dir()));
    }

    #[test]
    fn test_log_dir_is_under_state() {
        assert!(log_dir().starts_with(state_dir()));
        assert_eq!(log_dir().file_name().unwrap(), "log");
    }

    // ==================== ensure_dir Tests ====================

    #[test]
    fn test_ensure_dir_nested() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Second call is a no-op
        ensure_dir(&nested).unwrap();
    }

    #[test]
    fn test_ensure_private_dir_mode() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("jobs").join("client");
        ensure_private_dir(&dir).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
