use std::{
    fmt,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
};

use crate::launch::LaunchSpec;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the server gets SIGTERM instead of running orphaned.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// How the OS reported the end of the child. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitReport {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }

    /// `wait()` itself failed; the process state is unknown but treated as gone.
    fn wait_failed() -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Line reader over one of the child's output pipes.
pub enum LineReader {
    Stdout(BufReader<ChildStdout>),
    Stderr(BufReader<ChildStderr>),
}

impl LineReader {
    pub fn stream_name(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Stderr(_) => "stderr",
        }
    }

    /// `Ok(None)` at end of stream. Invalid UTF-8 is replaced rather than ending the stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self {
            Self::Stdout(reader) => next_lossy(reader).await,
            Self::Stderr(reader) => next_lossy(reader).await,
        }
    }
}

async fn next_lossy<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write side of the child's stdin.
pub struct StdinSink {
    stdin: ChildStdin,
}

impl StdinSink {
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.stdin.write_all(&buf).await?;
        self.stdin.flush().await
    }
}

/// Forcibly terminates the child. Survives the handle being moved into the exit watcher.
///
/// Shares the pid slot with the handle: the slot is emptied under its lock when the child
/// is reaped, so a kill never reaches a recycled process group.
#[derive(Debug, Clone, Default)]
pub struct ProcessKiller {
    pid: Arc<Mutex<Option<u32>>>,
}

impl ProcessKiller {
    fn lock(&self) -> MutexGuard<'_, Option<u32>> {
        self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// SIGKILL to the child's process group, taking any helpers it forked with it.
    #[cfg(unix)]
    pub fn kill(&self) -> std::io::Result<()> {
        let slot = self.lock();
        let Some(pid) = *slot else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "process already exited",
            ));
        };
        let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn kill(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "kill is only supported on unix",
        ))
    }
}

/// One spawned server process and its three pipes.
///
/// The pipes are taken out individually so each can be driven by its own task; `wait`
/// consumes the handle and resolves once, for any kind of exit.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    killer: ProcessKiller,
}

impl ProcessHandle {
    pub fn spawn(spec: &LaunchSpec) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.exec);
        cmd.current_dir(&spec.cwd)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        let killer = ProcessKiller {
            pid: Arc::new(Mutex::new(pid)),
        };
        Ok(Self { child, pid, killer })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    pub fn take_stdin(&mut self) -> Option<StdinSink> {
        self.child.stdin.take().map(|stdin| StdinSink { stdin })
    }

    pub fn take_stdout(&mut self) -> Option<LineReader> {
        self.child
            .stdout
            .take()
            .map(|out| LineReader::Stdout(BufReader::new(out)))
    }

    pub fn take_stderr(&mut self) -> Option<LineReader> {
        self.child
            .stderr
            .take()
            .map(|err| LineReader::Stderr(BufReader::new(err)))
    }

    /// Resolves once the child is reaped. Reaping happens with the killer's slot locked and
    /// empties it, so the pid is never signalled after it may have been reused.
    pub async fn wait(mut self) -> ExitReport {
        let mut tick = tokio::time::interval(REAP_POLL_INTERVAL);
        loop {
            tick.tick().await;
            let mut slot = self.killer.lock();
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    *slot = None;
                    return ExitReport::from_status(status);
                }
                Ok(None) => {}
                Err(err) => {
                    *slot = None;
                    tracing::warn!(error = %err, pid = ?self.pid, "waiting on server process failed");
                    return ExitReport::wait_failed();
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh", vec!["-c".to_string(), script.to_string()], ".")
    }

    #[tokio::test]
    async fn reads_both_streams_and_reports_exit_code() {
        let mut handle = ProcessHandle::spawn(&sh("echo out; echo err 1>&2; exit 3")).unwrap();
        let mut out = handle.take_stdout().unwrap();
        let mut err = handle.take_stderr().unwrap();
        assert_eq!(out.stream_name(), "stdout");
        assert_eq!(err.stream_name(), "stderr");

        assert_eq!(out.next_line().await.unwrap().as_deref(), Some("out"));
        assert_eq!(err.next_line().await.unwrap().as_deref(), Some("err"));
        assert_eq!(out.next_line().await.unwrap(), None);

        let exit = handle.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success);
        assert_eq!(exit.to_string(), "exit code 3");
    }

    #[tokio::test]
    async fn stdin_lines_are_newline_terminated() {
        let mut handle = ProcessHandle::spawn(&sh("read a; read b; echo \"$b-$a\"")).unwrap();
        let mut stdin = handle.take_stdin().unwrap();
        let mut out = handle.take_stdout().unwrap();
        stdin.send_line("first").await.unwrap();
        stdin.send_line("second").await.unwrap();
        assert_eq!(out.next_line().await.unwrap().as_deref(), Some("second-first"));
        assert!(handle.wait().await.success);
    }

    #[tokio::test]
    async fn killer_terminates_after_handle_moved() {
        let handle = ProcessHandle::spawn(&sh("sleep 30")).unwrap();
        let killer = handle.killer();
        let waiter = tokio::spawn(handle.wait());
        killer.kill().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(exit.to_string(), format!("signal {}", libc::SIGKILL));
    }

    #[tokio::test]
    async fn killer_is_disarmed_once_reaped() {
        let handle = ProcessHandle::spawn(&sh("exit 0")).unwrap();
        let killer = handle.killer();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(exit.success);
        let err = killer.kill().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn closing_stdout_does_not_block_stderr_or_stdin() {
        let mut handle = ProcessHandle::spawn(&sh(
            "exec 1>&-; echo up >&2; read line; echo \"in:$line\" >&2",
        ))
        .unwrap();
        let mut stdin = handle.take_stdin().unwrap();
        let mut out = handle.take_stdout().unwrap();
        let mut err = handle.take_stderr().unwrap();

        let eof = tokio::time::timeout(Duration::from_secs(5), out.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eof, None);

        assert_eq!(err.next_line().await.unwrap().as_deref(), Some("up"));
        stdin.send_line("hello").await.unwrap();
        assert_eq!(err.next_line().await.unwrap().as_deref(), Some("in:hello"));
        assert!(handle.wait().await.success);
    }

    #[tokio::test]
    async fn external_kill_is_reported() {
        let handle = ProcessHandle::spawn(&sh("sleep 30")).unwrap();
        let pid = handle.pid().unwrap();
        let waiter = tokio::spawn(handle.wait());
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        assert_eq!(rc, 0);
        let exit = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success);
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let spec = LaunchSpec::new("/definitely/not/here", Vec::new(), ".");
        assert!(ProcessHandle::spawn(&spec).is_err());
    }
}
