use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SystemError;

/// How the child's output streams are collected
#[derive(Debug, Clone)]
pub enum Capture {
    /// stdout and stderr are piped and kept apart
    Separate,
    /// stdout and stderr share one file, in the order the child wrote them
    Merged(PathBuf),
}

/// An external command that must finish within `limit`
#[derive(Debug)]
pub struct BoundedCommand<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub limit: Duration,
    /// Time between SIGTERM and SIGKILL once the limit is hit
    pub grace: Duration,
    pub capture: Capture,
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub command: String,
    /// Merged output when captured with [`Capture::Merged`]
    pub stdout: String,
    pub stderr: String,
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Runs a command in its own process group and waits for it, at most until `limit`
///
/// On expiry the whole group gets SIGTERM, then SIGKILL after the grace interval. The group is
/// also killed after a normal exit so no descendant outlives the call.
pub async fn run_bounded(
    cmd: BoundedCommand<'_>,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, SystemError> {
    let command_line = cmd.argv.join(" ");
    let Some((program, args)) = cmd.argv.split_first() else {
        return Err(SystemError::Launch {
            command: command_line,
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cmd.cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .process_group(0);

    match &cmd.capture {
        Capture::Separate => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        Capture::Merged(path) => {
            let io_err = |source| SystemError::Io {
                context: "run_bounded",
                path: path.clone(),
                source,
            };
            let file = fs::File::create(path).map_err(io_err)?;
            command
                .stdout(Stdio::from(file.try_clone().map_err(io_err)?))
                .stderr(Stdio::from(file));
        }
    }

    let mut child = command.spawn().map_err(|source| SystemError::Launch {
        command: command_line.clone(),
        source,
    })?;
    let pgid = child.id().map(|id| id as i32);
    log::debug!("Spawned `{command_line}` as process group {pgid:?}");

    let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
    let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = tokio::time::sleep(cmd.limit) => Wake::Deadline,
        _ = cancel.cancelled() => Wake::Cancelled,
    };

    let launch_err = |source| SystemError::Launch {
        command: command_line.clone(),
        source,
    };
    let (status, timed_out) = match wake {
        Wake::Exited(status) => {
            let status = status.map_err(launch_err)?;
            // descendants may still hold the pipes open
            signal_group(pgid, libc::SIGKILL);
            (status, false)
        }
        Wake::Deadline => {
            log::warn!(
                "`{command_line}` exceeded {:.1}s, terminating process group",
                cmd.limit.as_secs_f64()
            );
            let status = terminate(&mut child, pgid, cmd.grace)
                .await
                .map_err(launch_err)?;
            (status, true)
        }
        Wake::Cancelled => {
            log::warn!("Cancelling `{command_line}`");
            let _ = terminate(&mut child, pgid, cmd.grace).await;
            return Err(SystemError::Cancelled);
        }
    };

    let mut output = ProcessOutput {
        command: command_line,
        stdout: collect(stdout_task).await,
        stderr: collect(stderr_task).await,
        status: Some(status),
        timed_out,
    };

    if let Capture::Merged(path) = &cmd.capture {
        output.stdout = fs::read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|source| SystemError::Io {
                context: "run_bounded",
                path: path.clone(),
                source,
            })?;
    }

    Ok(output)
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL whatever is left
async fn terminate(child: &mut Child, pgid: Option<i32>, grace: Duration) -> io::Result<ExitStatus> {
    if pgid.is_none() {
        child.start_kill()?;
    }
    signal_group(pgid, libc::SIGTERM);

    let exited = tokio::time::timeout(grace, child.wait()).await;
    signal_group(pgid, libc::SIGKILL);

    match exited {
        Ok(status) => status,
        Err(_) => child.wait().await,
    }
}

fn signal_group(pgid: Option<i32>, signal: libc::c_int) {
    let Some(pgid) = pgid else {
        return;
    };

    // SAFETY: a negative pid addresses only the process group created for this child.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to signal process group {pgid}: {err}");
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(task: Option<JoinHandle<io::Result<Vec<u8>>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };

    match task.await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            log::error!("Failed to read child output: {e}");
            String::new()
        }
        Err(e) => {
            log::error!("Output reader task failed: {e}");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn bounded<'a>(argv: &'a [String], cwd: &'a Path, limit: Duration) -> BoundedCommand<'a> {
        BoundedCommand {
            argv,
            cwd,
            limit,
            grace: Duration::from_millis(200),
            capture: Capture::Separate,
        }
    }

    #[tokio::test]
    async fn test_captures_streams_separately() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("echo out; echo err >&2; exit 3");
        let output = run_bounded(
            bounded(&argv, dir.path(), Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.code(), Some(3));
        assert!(!output.timed_out);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_merged_capture_writes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("echo one; echo two >&2");
        let mut cmd = bounded(&argv, dir.path(), Duration::from_secs(10));
        cmd.capture = Capture::Merged(dir.path().join("merged.txt"));

        let output = run_bounded(cmd, &CancellationToken::new()).await.unwrap();

        assert_eq!(output.stdout, "one\ntwo\n");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_deadline_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        // the grandchild keeps stdout open; the call must still return promptly
        let argv = sh("trap '' TERM; sleep 30 & sleep 30");
        let start = Instant::now();
        let output = run_bounded(
            bounded(&argv, dir.path(), Duration::from_millis(300)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("sleep 30");
        let token = CancellationToken::new();
        token.cancel();

        let result = run_bounded(bounded(&argv, dir.path(), Duration::from_secs(30)), &token).await;
        assert!(matches!(result, Err(SystemError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["definitely-not-a-real-binary-4821".to_string()];
        let result = run_bounded(
            bounded(&argv, dir.path(), Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(SystemError::Launch { .. })));
    }
}
