//! Runs the external tool in its own process group with a hard deadline.

use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    ffi::OsStr,
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time,
};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RunError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for tool: {0}")]
    Wait(#[source] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool output exceeded {0} bytes")]
    OutputTooLarge(usize),
}

/// Kills every process in a group unless disarmed.
///
/// Must be dropped before the group leader is reaped so the group id cannot
/// have been reused.
struct ProcessGroup(Option<Pid>);

pub(crate) async fn run<I, S>(
    program: &Path,
    args: I,
    timeout: Duration,
    max_output: usize,
) -> Result<Output, RunError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        tool: program.display().to_string(),
        source,
    })?;
    let mut group = ProcessGroup::new(child.id());
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let exec = async {
        let (stdout, stderr, status) = tokio::join!(
            read_bounded(stdout, max_output),
            read_bounded(stderr, max_output),
            child.wait(),
        );
        (stdout, stderr, status)
    };

    match time::timeout(timeout, exec).await {
        Ok((stdout, stderr, status)) => {
            let status = status.map_err(RunError::Wait)?;
            // The leader has been reaped; its id may be reused.
            group.disarm();
            let (stdout, stdout_exceeded) = stdout;
            let (stderr, stderr_exceeded) = stderr;
            if stdout_exceeded || stderr_exceeded {
                return Err(RunError::OutputTooLarge(max_output));
            }
            Ok(Output {
                status,
                stdout,
                stderr,
            })
        }
        Err(_) => {
            debug!(?timeout, "Killing timed out tool");
            group.kill();
            if let Err(error) = child.wait().await {
                warn!(%error, "Failed to reap timed out tool");
            }
            Err(RunError::Timeout(timeout))
        }
    }
}

/// Drains a stream to EOF, keeping at most `limit` bytes. Returns whether
/// the limit was exceeded.
async fn read_bounded<R>(stream: Option<R>, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    let mut exceeded = false;
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    exceeded = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, exceeded)
}

// === impl ProcessGroup ===

impl ProcessGroup {
    fn new(id: Option<u32>) -> Self {
        Self(id.and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw))
    }

    fn disarm(&mut self) {
        self.0 = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(error) => warn!(%error, %pgid, "Failed to kill tool process group"),
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
