//! Running one deploy command inside a sandbox.

use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    mcpdock_common::PluginId,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::Command,
        sync::broadcast,
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::error::{DeployError, Result};

/// Lines of output kept for the failure diagnostic.
const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line printed by a deploy command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub id: PluginId,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Exited { exit_code: i32, output: String },
    Cancelled,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `cwd` with `env` added to the inherited environment.
    ///
    /// When `cancel` fires the runner must kill the command and everything it
    /// spawned, and reap it, before returning `Cancelled`.
    async fn run(
        &self,
        id: &PluginId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        sink: &broadcast::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome>;
}

/// Runs commands through `<shell> -c`, each in its own process group.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        id: &PluginId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        sink: &broadcast::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome> {
        debug!(plugin = %id, %command, cwd = %cwd.display(), "running deploy command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            DeployError::external(format!("failed to spawn `{command}`"), e)
        })?;
        // Gone from `child` once it is reaped; descendants keep the group alive.
        let pgid = child.id();

        let tail = Arc::new(Mutex::new(VecDeque::new()));
        let mut pumps: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(
                out,
                id.clone(),
                OutputStream::Stdout,
                sink.clone(),
                Arc::clone(&tail),
            )));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(
                err,
                id.clone(),
                OutputStream::Stderr,
                sink.clone(),
                Arc::clone(&tail),
            )));
        }

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            () = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            if !pgid.is_some_and(kill_group) {
                let _ = child.start_kill();
            }
            // Reap before reporting so no process outlives the cancellation.
            let _ = child.wait().await;
            abort_all(&pumps);
            debug!(plugin = %id, %command, "deploy command cancelled");
            return Ok(CommandOutcome::Cancelled);
        };

        // The shell is gone, but background processes it started may still
        // hold the output pipes open.
        let drain = tokio::select! {
            () = async {
                for handle in pumps.iter_mut() {
                    let _ = handle.await;
                }
            } => Drain::Finished,
            () = tokio::time::sleep(DRAIN_GRACE) => Drain::TimedOut,
            () = cancel.cancelled() => Drain::Cancelled,
        };
        match drain {
            Drain::Finished => {},
            Drain::TimedOut => {
                warn!(plugin = %id, %command, "command left processes behind, killing its group");
                if let Some(pgid) = pgid {
                    kill_group(pgid);
                }
                abort_all(&pumps);
            },
            Drain::Cancelled => {
                if let Some(pgid) = pgid {
                    kill_group(pgid);
                }
                abort_all(&pumps);
                debug!(
                    plugin = %id,
                    %command,
                    "deploy command cancelled after its shell exited"
                );
                return Ok(CommandOutcome::Cancelled);
            },
        }

        let output = match tail.lock() {
            Ok(tail) => Vec::from(tail.clone()).join("\n"),
            Err(poisoned) => Vec::from(poisoned.into_inner().clone()).join("\n"),
        };
        let exit_code = status.code().unwrap_or(-1);
        debug!(plugin = %id, %command, exit_code, "deploy command finished");
        Ok(CommandOutcome::Exited { exit_code, output })
    }
}

/// How long output is drained after the shell exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Drain {
    Finished,
    TimedOut,
    Cancelled,
}

fn abort_all(pumps: &[JoinHandle<()>]) {
    for pump in pumps {
        pump.abort();
    }
}

async fn pump<R>(
    reader: R,
    id: PluginId,
    stream: OutputStream,
    sink: broadcast::Sender<OutputLine>,
    tail: Arc<Mutex<VecDeque<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = sink.send(OutputLine {
                    id: id.clone(),
                    stream,
                    line: line.clone(),
                });
                if let Ok(mut tail) = tail.lock() {
                    tail.push_back(line);
                    if tail.len() > OUTPUT_TAIL_LINES {
                        tail.pop_front();
                    }
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %id, error = %e, "failed to read command output");
                break;
            },
        }
    }
}

/// SIGKILL the process group led by `pgid`. The group outlives its leader
/// while any member is alive. Returns `false` when nothing was signalled.
#[cfg(unix)]
fn kill_group(pgid: u32) -> bool {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, error = %e, "killpg failed");
            false
        },
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> bool {
    false
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn id() -> PluginId {
        PluginId::new("runner").unwrap()
    }

    #[tokio::test]
    async fn test_exit_code_and_output_are_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let out = ShellRunner::default()
            .run(
                &id(),
                "echo hello; echo oops >&2; exit 3",
                tmp.path(),
                &BTreeMap::new(),
                &tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let CommandOutcome::Exited { exit_code, output } = out else {
            panic!("expected exit");
        };
        assert_eq!(exit_code, 3);
        assert!(output.contains("hello"));
        assert!(output.contains("oops"));

        let mut streamed = Vec::new();
        while let Ok(line) = rx.try_recv() {
            streamed.push(line.line);
        }
        assert!(streamed.contains(&"hello".to_string()));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let env = BTreeMap::from([("GREETING".to_string(), "hi there".to_string())]);
        let out = ShellRunner::default()
            .run(
                &id(),
                "printf '%s' \"$GREETING\" > out.txt",
                tmp.path(),
                &env,
                &tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(out, CommandOutcome::Exited { exit_code: 0, .. }));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out.txt")).unwrap(),
            "hi there"
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let out = ShellRunner::default()
            .run(
                &id(),
                "sleep 30 & sleep 30; touch finished",
                tmp.path(),
                &BTreeMap::new(),
                &tx,
                cancel,
            )
            .await
            .unwrap();
        assert_eq!(out, CommandOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!tmp.path().join("finished").exists());
    }

    #[tokio::test]
    async fn test_cancel_after_shell_exit_kills_background_children() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let out = ShellRunner::default()
            .run(&id(), "sleep 30 & exit 0", tmp.path(), &BTreeMap::new(), &tx, cancel)
            .await
            .unwrap();
        assert_eq!(out, CommandOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_background_children_do_not_block_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let started = std::time::Instant::now();
        let out = ShellRunner::default()
            .run(
                &id(),
                "sleep 30 & echo built",
                tmp.path(),
                &BTreeMap::new(),
                &tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let CommandOutcome::Exited { exit_code, output } = out else {
            panic!("expected exit");
        };
        assert_eq!(exit_code, 0);
        assert_eq!(output, "built");
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(2));
    }
}
