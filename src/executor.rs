use crate::error::{RepairError, RepairResult};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Failures still carry the output captured so far, see
/// [`RepairError::captured_output`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str], deadline: Instant)
    -> RepairResult<String>;
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        deadline: Instant,
    ) -> RepairResult<String> {
        let line = command_line(program, args);
        debug!("Running {}", line);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            RepairError::command_failed(&line, format!("spawn failed: {}", e), String::new())
        })?;
        let mut group = ProcessGroupGuard { pgid: child.id() };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut captured = String::new();
        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        let mut open = true;
        let status = loop {
            tokio::select! {
                received = rx.recv(), if open => match received {
                    Some(text) => push_line(&mut captured, &text),
                    None => open = false,
                },
                status = child.wait() => break status,
                _ = &mut expired => {
                    warn!("{} exceeded its deadline, killing it", line);
                    return Err(RepairError::Timeout { command: line, output: captured });
                }
            }
        };

        // A descendant may still hold the pipes after the child exits.
        if open {
            let grace = sleep_until(Instant::now() + DRAIN_GRACE);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(text) => push_line(&mut captured, &text),
                        None => {
                            open = false;
                            break;
                        }
                    },
                    _ = &mut grace => {
                        debug!("{} exited but its output is still open", line);
                        break;
                    }
                }
            }
        }
        if !open {
            group.pgid = None;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => return Err(RepairError::command_failed(&line, e.to_string(), captured)),
        };

        debug!("{} finished with {}", line, status);
        if status.success() {
            Ok(captured)
        } else {
            Err(RepairError::command_failed(&line, status.to_string(), captured))
        }
    }
}

fn push_line(captured: &mut String, text: &str) {
    captured.push_str(text);
    captured.push('\n');
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send(text).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Kills what is left of the child's process group.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            unsafe {
                libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
}

/// Replays results queued per command line (`"pkg update -f"`). Unscripted
/// commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, String>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&self, command: &str, output: &str) -> &Self {
        self.push(command, Ok(output.to_string()))
    }

    pub fn fail(&self, command: &str, output: &str) -> &Self {
        self.push(command, Err(output.to_string()))
    }

    fn push(&self, command: &str, result: Result<String, String>) -> &Self {
        self.scripts
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        _deadline: Instant,
    ) -> RepairResult<String> {
        let line = command_line(program, args);
        self.calls.lock().push(line.clone());
        let scripted = self
            .scripts
            .lock()
            .get_mut(&line)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(output)) => Err(RepairError::command_failed(&line, "exit status: 1", output)),
            None => Ok(String::new()),
        }
    }
}
