//! Executor seam and per-job log streaming.
//!
//! The engine never knows how a job type does its work. It hands an
//! [`ExecutionRequest`] to an [`Executor`] together with a [`LogSink`] and a
//! cancellation token, and gets a [`ResultEnvelope`] back.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flowpatch_common::{JobPayload, JobType, ResultEnvelope};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;

/// Stdout prefix of the line carrying the final result envelope.
pub const RESULT_LINE_PREFIX: &str = "FLOWPATCH_RESULT ";

/// How long a finished executor's stderr is read after it exits.
const STDERR_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    /// The worktree for worktree jobs, otherwise the project directory
    pub working_dir: PathBuf,
    pub attempt: u32,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one attempt. An `Err` is an infrastructure failure (the program
    /// could not be started, or it was killed); a job that ran and failed
    /// returns `Ok` with a failure envelope.
    async fn run(
        &self,
        request: ExecutionRequest,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<ResultEnvelope>;
}

// ── Log channel ──────────────────────────────────────────────────────

/// Producer half of a job's log channel. Pushing never blocks; once
/// `capacity` lines are waiting, the oldest one is dropped.
#[derive(Debug)]
pub struct LogSink {
    shared: Arc<LogShared>,
}

pub struct LogStream {
    shared: Arc<LogShared>,
}

pub enum LogItem {
    Line(String),
    /// Lines lost because the consumer fell behind.
    Dropped(u64),
}

#[derive(Debug)]
struct LogShared {
    capacity: usize,
    state: Mutex<LogBuffer>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct LogBuffer {
    lines: VecDeque<String>,
    dropped: u64,
    sinks: usize,
}

impl LogShared {
    fn buffer(&self) -> MutexGuard<'_, LogBuffer> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn log_channel(capacity: usize) -> (LogSink, LogStream) {
    let capacity = capacity.max(1);
    let shared = Arc::new(LogShared {
        capacity,
        state: Mutex::new(LogBuffer {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            dropped: 0,
            sinks: 1,
        }),
        notify: Notify::new(),
    });
    (
        LogSink {
            shared: shared.clone(),
        },
        LogStream { shared },
    )
}

impl LogSink {
    pub fn push(&self, line: impl Into<String>) {
        let mut buffer = self.shared.buffer();
        if buffer.lines.len() >= self.shared.capacity {
            buffer.lines.pop_front();
            buffer.dropped += 1;
        }
        buffer.lines.push_back(line.into());
        drop(buffer);
        self.shared.notify.notify_one();
    }
}

impl Clone for LogSink {
    fn clone(&self) -> Self {
        self.shared.buffer().sinks += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let mut buffer = self.shared.buffer();
        buffer.sinks = buffer.sinks.saturating_sub(1);
        let closed = buffer.sinks == 0;
        drop(buffer);
        if closed {
            self.shared.notify.notify_one();
        }
    }
}

impl LogStream {
    /// Next item, or `None` once every sink is dropped and the buffer is
    /// drained. Lost lines are reported before the lines that replaced them.
    pub async fn next(&mut self) -> Option<LogItem> {
        loop {
            {
                let mut buffer = self.shared.buffer();
                if buffer.dropped > 0 {
                    return Some(LogItem::Dropped(std::mem::take(&mut buffer.dropped)));
                }
                if let Some(line) = buffer.lines.pop_front() {
                    return Some(LogItem::Line(line));
                }
                if buffer.sinks == 0 {
                    return None;
                }
            }
            // Single consumer: a notify_one issued before this await leaves a permit
            self.shared.notify.notified().await;
        }
    }
}

/// Receives the log lines of running jobs.
pub trait LogObserver: Send + Sync {
    fn on_line(&self, job_id: &str, line: &str);

    fn on_dropped(&self, job_id: &str, count: u64) {
        let _ = (job_id, count);
    }
}

/// Forwards executor output to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingLogObserver;

impl LogObserver for TracingLogObserver {
    fn on_line(&self, job_id: &str, line: &str) {
        tracing::debug!(target: "flowpatch::executor", job_id = %job_id, "{}", line);
    }

    fn on_dropped(&self, job_id: &str, count: u64) {
        tracing::warn!(job_id = %job_id, count, "executor log lines dropped");
    }
}

/// Drain `stream` into `observer` until the sink side closes.
pub async fn forward_logs(job_id: String, mut stream: LogStream, observer: Arc<dyn LogObserver>) {
    while let Some(item) = stream.next().await {
        match item {
            LogItem::Line(line) => observer.on_line(&job_id, &line),
            LogItem::Dropped(n) => observer.on_dropped(&job_id, n),
        }
    }
}

// ── Subprocess executor ──────────────────────────────────────────────

/// Runs the configured program once per attempt.
///
/// The job is described through `FLOWPATCH_JOB_ID`, `FLOWPATCH_JOB_TYPE`,
/// `FLOWPATCH_JOB_PAYLOAD` and `FLOWPATCH_ATTEMPT`. A stdout line starting
/// with `FLOWPATCH_RESULT ` carries the result envelope as JSON; without one
/// the exit status decides.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &ExecutorSection) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

/// Parse a result line; `None` for ordinary output.
pub fn parse_result_line(line: &str) -> Option<Result<ResultEnvelope>> {
    let json = line.strip_prefix(RESULT_LINE_PREFIX)?;
    Some(serde_json::from_str(json.trim()).context("Invalid FLOWPATCH_RESULT payload"))
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(
        &self,
        request: ExecutionRequest,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<ResultEnvelope> {
        let payload =
            serde_json::to_string(&request.payload).context("Failed to serialize job payload")?;
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .current_dir(&request.working_dir)
            .env("FLOWPATCH_JOB_ID", &request.job_id)
            .env("FLOWPATCH_JOB_TYPE", request.job_type.as_str())
            .env("FLOWPATCH_JOB_PAYLOAD", payload)
            .env("FLOWPATCH_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill also reaches anything the program started
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn executor '{}'", self.command))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(format!("[stderr] {}", line));
                    last = Some(line);
                }
                last
            })
        });

        let mut envelope = None;
        let stdout = child.stdout.take().context("Executor stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    kill_tree(&mut child, &request.job_id).await;
                    if let Some(task) = &stderr_task {
                        task.abort();
                    }
                    anyhow::bail!("Executor canceled");
                }
                line = lines.next_line() => {
                    match line.context("Failed to read executor output")? {
                        Some(line) => match parse_result_line(&line) {
                            Some(Ok(parsed)) => envelope = Some(parsed),
                            Some(Err(e)) => logs.push(format!("{:#}", e)),
                            None => logs.push(line),
                        },
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                kill_tree(&mut child, &request.job_id).await;
                if let Some(task) = &stderr_task {
                    task.abort();
                }
                anyhow::bail!("Executor canceled");
            }
            status = child.wait() => status.context("Failed to wait for executor")?,
        };
        // A background descendant may still hold stderr open
        let last_stderr = match stderr_task {
            Some(mut task) => match tokio::time::timeout(STDERR_GRACE, &mut task).await {
                Ok(joined) => joined.ok().flatten(),
                Err(_) => {
                    task.abort();
                    None
                }
            },
            None => None,
        };

        Ok(match envelope {
            Some(envelope) => envelope,
            None if status.success() => ResultEnvelope::success(),
            None => {
                let mut message = match status.code() {
                    Some(code) => format!("Executor exited with status {}", code),
                    None => "Executor terminated by signal".to_string(),
                };
                if let Some(line) = last_stderr {
                    message.push_str(": ");
                    message.push_str(&line);
                }
                ResultEnvelope::failure(message)
            }
        })
    }
}

/// Kill the executor and every process in its group.
async fn kill_tree(child: &mut Child, job_id: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: kill(2) takes no pointers; the group id is the child's pid
            let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
            if rc != 0 {
                tracing::debug!(job_id = %job_id, error = %std::io::Error::last_os_error(), "process group kill failed");
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(job_id = %job_id, error = %e, "failed to kill executor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpatch_common::ResultStatus;
    use flowpatch_common::job::EmptyPayload;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<String>>,
        dropped: Mutex<u64>,
    }

    impl LogObserver for Collect {
        fn on_line(&self, _job_id: &str, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn on_dropped(&self, _job_id: &str, count: u64) {
            *self.dropped.lock().unwrap() += count;
        }
    }

    fn request(dir: &std::path::Path) -> ExecutionRequest {
        ExecutionRequest {
            job_id: "job-1".into(),
            job_type: JobType::DocsRefresh,
            payload: JobPayload::DocsRefresh(EmptyPayload {}),
            working_dir: dir.to_path_buf(),
            attempt: 1,
        }
    }

    #[test]
    fn test_parse_result_line() {
        assert!(parse_result_line("just output").is_none());
        let parsed = parse_result_line(r#"FLOWPATCH_RESULT {"status":"pending_approval"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.status, ResultStatus::PendingApproval);
        assert!(parse_result_line("FLOWPATCH_RESULT {nope").unwrap().is_err());
    }

    #[tokio::test]
    async fn test_log_channel_drops_oldest_when_full() {
        let (sink, stream) = log_channel(4);
        for i in 0..6 {
            sink.push(format!("line {}", i));
        }
        drop(sink);

        let observer = Arc::new(Collect::default());
        forward_logs("job-1".into(), stream, observer.clone()).await;
        assert_eq!(*observer.dropped.lock().unwrap(), 2);
        assert_eq!(
            *observer.lines.lock().unwrap(),
            vec!["line 2", "line 3", "line 4", "line 5"]
        );
    }

    #[tokio::test]
    async fn test_log_channel_keeps_exactly_capacity_lines() {
        let (sink, stream) = log_channel(1000);
        for i in 0..1010 {
            sink.push(format!("line {}", i));
        }
        drop(sink);

        let observer = Arc::new(Collect::default());
        forward_logs("job-1".into(), stream, observer.clone()).await;
        let lines = observer.lines.lock().unwrap();
        assert_eq!(*observer.dropped.lock().unwrap(), 10);
        assert_eq!(lines.len(), 1000);
        assert_eq!(lines[0], "line 10");
        assert_eq!(lines[999], "line 1009");
    }

    #[tokio::test]
    async fn test_log_stream_wakes_for_late_lines_and_closes_with_last_sink() {
        let (sink, stream) = log_channel(8);
        let observer = Arc::new(Collect::default());
        let forward = tokio::spawn(forward_logs("job-1".into(), stream, observer.clone()));

        let second = sink.clone();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sink.push("first");
        drop(sink);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        second.push("second");
        drop(second);

        tokio::time::timeout(std::time::Duration::from_secs(5), forward)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*observer.lines.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_command_executor_reads_result_line() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo "working on $FLOWPATCH_JOB_ID"; echo 'FLOWPATCH_RESULT {"status":"success","artifacts":{"card_status":"testing"}}'"#.into(),
            ],
        );
        let (sink, stream) = log_channel(16);
        let observer = Arc::new(Collect::default());
        let forward = tokio::spawn(forward_logs("job-1".into(), stream, observer.clone()));

        let envelope = executor
            .run(request(dir.path()), sink, CancellationToken::new())
            .await
            .unwrap();
        forward.await.unwrap();

        assert_eq!(envelope.status, ResultStatus::Success);
        assert_eq!(
            envelope.card_status(),
            Some(flowpatch_common::CardStatus::Testing)
        );
        assert_eq!(*observer.lines.lock().unwrap(), vec!["working on job-1"]);
    }

    #[tokio::test]
    async fn test_command_executor_maps_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let (sink, _stream) = log_channel(16);
        let envelope = executor
            .run(request(dir.path()), sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(envelope.status, ResultStatus::Failure);
        assert_eq!(
            envelope.error.as_deref(),
            Some("Executor exited with status 3: boom")
        );
    }

    #[tokio::test]
    async fn test_command_executor_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new("sh", vec!["-c".into(), "sleep 30".into()]);
        let (sink, _stream) = log_channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = executor.run(request(dir.path()), sink, cancel).await.unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                "(while true; do echo tick >> beat; sleep 0.05; done) & sleep 30".into(),
            ],
        );
        let (sink, stream) = log_channel(16);
        let observer = Arc::new(Collect::default());
        let forward = tokio::spawn(forward_logs("job-1".into(), stream, observer));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = executor.run(request(dir.path()), sink, cancel).await.unwrap_err();
        assert!(err.to_string().contains("canceled"));
        tokio::time::timeout(std::time::Duration::from_secs(5), forward)
            .await
            .expect("log stream left open after cancel")
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let beat = dir.path().join("beat");
        let before = std::fs::metadata(&beat).map(|m| m.len()).unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let after = std::fs::metadata(&beat).map(|m| m.len()).unwrap_or(0);
        assert_eq!(before, after, "background loop survived the cancel");
    }

    #[tokio::test]
    async fn test_command_executor_spawn_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new("/definitely/not/a/program", vec![]);
        let (sink, _stream) = log_channel(16);
        let err = executor
            .run(request(dir.path()), sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn executor"));
    }
}
