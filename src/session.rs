//! Session channel: one authenticated ssh connection reused for the whole job
//!
//! The connection is an OpenSSH control master. Every later `ssh` and `scp`
//! call rides on its control socket, so credentials are requested once per job
//! no matter how many blocks or rounds follow.

use crate::error::TransferError;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// Output of one remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Which way a block copy goes relative to the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    Upload,
    Download,
}

/// Operations the rest of the job needs from a remote connection.
pub trait SessionChannel: Send + Sync {
    /// `user@host` this channel talks to
    fn target(&self) -> &str;

    /// Run a command through the remote login shell.
    fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Copy one block between a local path and a remote path.
    fn copy_block(&self, local: &Path, remote: &Path, direction: CopyDirection) -> Result<()>;

    /// Run a command and turn a non-zero exit into `RemoteCommand`.
    fn run_checked(&self, command: &str) -> Result<String> {
        let out = self.run(command)?;
        if !out.success() {
            return Err(TransferError::RemoteCommand {
                command: command.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(out.stdout)
    }
}

/// Local tools a remote job cannot start without.
pub fn check_local_tools() -> Result<(), TransferError> {
    for tool in ["ssh", "scp"] {
        which::which(tool).map_err(|_| TransferError::DependencyMissing {
            tool: tool.to_string(),
            side: "local".to_string(),
        })?;
    }
    Ok(())
}

/// OpenSSH control-master session.
pub struct SshSession {
    target: String,
    options: Vec<String>,
    // holds the control socket; removed when the session is dropped
    control_dir: TempDir,
    control_path: PathBuf,
    closed: bool,
}

impl SshSession {
    /// Establish the master connection. May prompt for credentials on the tty.
    pub fn open(target: &str, options: &[String]) -> Result<Self, TransferError> {
        let control_dir = tempfile::Builder::new()
            .prefix("blockhop-ssh-")
            .tempdir()
            .map_err(|e| TransferError::Other(e.into()))?;
        let control_path = control_dir.path().join("ctl");
        let session = Self {
            target: target.to_string(),
            options: options.to_vec(),
            control_dir,
            control_path,
            closed: false,
        };

        // stderr goes to a file: the backgrounded master may keep a pipe open
        let log_path = session.control_dir.path().join("open.log");
        let log = File::create(&log_path).map_err(|e| TransferError::Other(e.into()))?;
        let status = Command::new("ssh")
            .args(session.master_args())
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(log)
            .status()
            .map_err(|e| TransferError::Unreachable {
                target: target.to_string(),
                detail: format!("cannot run ssh: {e}"),
            })?;
        if !status.success() {
            let detail = fs::read_to_string(&log_path).unwrap_or_default();
            // nothing was established, so there is nothing to close
            let mut session = session;
            session.closed = true;
            return Err(classify_open_failure(target, detail.trim()));
        }
        Ok(session)
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
        ];
        args.extend(self.option_args());
        args.extend(["-f".to_string(), "-N".to_string(), self.target.clone()]);
        args
    }

    fn option_args(&self) -> Vec<String> {
        self.options
            .iter()
            .flat_map(|o| ["-o".to_string(), o.clone()])
            .collect()
    }

    fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.option_args());
        args
    }

    fn scp_args(&self) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.option_args());
        args
    }

    /// Tear down the master connection. Safe to call more than once.
    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let out = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .output()
            .context("run ssh -O exit")?;
        if !out.status.success() {
            anyhow::bail!(
                "closing session to {} failed: {}",
                self.target,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    /// Release the session explicitly.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl SessionChannel for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    fn run(&self, command: &str) -> Result<CommandOutput> {
        let out = Command::new("ssh")
            .args(self.client_args())
            .arg(&self.target)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("run remote command on {}", self.target))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            status: out.status.code().unwrap_or(-1),
        })
    }

    fn copy_block(&self, local: &Path, remote: &Path, direction: CopyDirection) -> Result<()> {
        let remote_spec = format!("{}:{}", self.target, remote.display());
        let local_spec = local.display().to_string();
        let (from, to) = match direction {
            CopyDirection::Upload => (local_spec, remote_spec),
            CopyDirection::Download => (remote_spec, local_spec),
        };
        let out = Command::new("scp")
            .args(self.scp_args())
            .arg(&from)
            .arg(&to)
            .stdin(Stdio::null())
            .output()
            .context("run scp")?;
        if !out.status.success() {
            anyhow::bail!(
                "scp {} -> {} failed: {}",
                from,
                to,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Tell an authentication refusal apart from a host we never reached.
fn classify_open_failure(target: &str, detail: &str) -> TransferError {
    let lower = detail.to_ascii_lowercase();
    let auth = [
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication methods",
    ];
    if auth.iter().any(|needle| lower.contains(needle)) {
        TransferError::AuthFailed {
            target: target.to_string(),
            detail: detail.to_string(),
        }
    } else {
        TransferError::Unreachable {
            target: target.to_string(),
            detail: if detail.is_empty() {
                "ssh exited without a diagnostic".to_string()
            } else {
                detail.to_string()
            },
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SshSession {
        let control_dir = tempfile::tempdir().unwrap();
        let control_path = control_dir.path().join("ctl");
        SshSession {
            target: "me@box".into(),
            options: vec!["Port=2222".into()],
            control_dir,
            control_path,
            // never spawn ssh -O exit from tests
            closed: true,
        }
    }

    #[test]
    fn master_backgrounds_after_auth() {
        let s = session();
        let args = s.master_args();
        assert_eq!(args[0], "-M");
        assert!(args.contains(&"ControlPersist=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-o", "Port=2222"]));
        assert_eq!(&args[args.len() - 3..], ["-f", "-N", "me@box"]);
    }

    #[test]
    fn clients_reuse_control_socket() {
        let s = session();
        let ctl = s.control_path.display().to_string();
        assert!(s.client_args().windows(2).any(|w| w[0] == "-S" && w[1] == ctl));
        assert!(s
            .scp_args()
            .contains(&format!("ControlPath={ctl}")));
        assert!(s.client_args().contains(&"ControlMaster=no".to_string()));
    }

    #[test]
    fn open_failures_are_classified() {
        let e = classify_open_failure("h", "me@h: Permission denied (publickey,password).");
        assert!(matches!(e, TransferError::AuthFailed { .. }));
        let e = classify_open_failure("h", "ssh: connect to host h port 22: Connection refused");
        assert!(matches!(e, TransferError::Unreachable { .. }));
        let e = classify_open_failure("h", "");
        assert!(e.to_string().contains("without a diagnostic"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/tmp/blockhop-staging"), "/tmp/blockhop-staging");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a!b"), r"'a'\!'b'");
    }
}
