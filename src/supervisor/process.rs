//! Adapter process lifecycle
//!
//! The child is owned by a watcher task for its whole life. The watcher
//! publishes the single `Running -> Exited` transition on a watch channel
//! and is the only place a kill is delivered from.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn, Instrument, Span};

use crate::common::config::AdapterConfig;
use crate::common::{Error, ExitInfo, Result};
use crate::launch::Expander;

use super::handshake::Handshake;

/// How long to keep reading output once the adapter has exited
const EXIT_DRAIN: Duration = Duration::from_millis(50);

/// Liveness of the adapter process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitInfo),
}

/// A spawned debug adapter
pub struct AdapterProcess {
    program: String,
    pid: Option<u32>,
    state_rx: watch::Receiver<ProcessState>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    /// Combined stdout/stderr, taken by the handshake detector
    output_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    span: Span,
}

impl std::fmt::Debug for AdapterProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl AdapterProcess {
    /// Spawn an adapter with already-expanded environment values
    pub fn spawn(program: &Path, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let span = tracing::info_span!("adapter", program = %program.display());
        Self::spawn_in(span, program, args, env)
    }

    /// Spawn an adapter, logging everything it does inside `span`
    pub fn spawn_in(
        span: Span,
        program: &Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::spawn(program.display(), e))?;
        let pid = child.id();

        info!(parent: &span, pid, args = ?args, "Spawned debug adapter");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", output_tx.clone(), span.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", output_tx, span.clone());
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_process(child, kill_rx, state_tx).instrument(span.clone()));

        Ok(Self {
            program: program.display().to_string(),
            pid,
            state_rx,
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            output_rx: tokio::sync::Mutex::new(Some(output_rx)),
            span,
        })
    }

    /// Spawn the adapter described by configuration
    ///
    /// Bare program names are looked up in PATH and `${env:NAME}`
    /// references in the environment are expanded first.
    pub fn from_config(config: &AdapterConfig, expander: &Expander) -> Result<Self> {
        let program = config.resolve_path()?;
        let env = expander.expand_env(&config.env)?;
        Self::spawn(&program, &config.args, &env)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// True until the process has exited
    pub fn is_alive(&self) -> bool {
        matches!(*self.state_rx.borrow(), ProcessState::Running)
    }

    /// Exit details, once the process has exited
    pub fn exit_info(&self) -> Option<ExitInfo> {
        match *self.state_rx.borrow() {
            ProcessState::Running => None,
            ProcessState::Exited(info) => Some(info),
        }
    }

    /// Lifecycle notifications for other components
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Wait until the process exits on its own
    pub async fn wait(&self) -> ExitInfo {
        wait_exited(&mut self.state_rx.clone()).await
    }

    /// Wait for the handshake line on the combined output
    ///
    /// The pattern is matched against everything read so far after each
    /// chunk, so a line split across reads still matches. Output stops
    /// being collected once this returns.
    pub async fn await_handshake(&self, pattern: &Regex, timeout: Duration) -> Result<Handshake> {
        let mut output = self
            .output_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("handshake already awaited".to_string()))?;
        let mut state_rx = self.state_rx.clone();

        let detect = async {
            let mut buffer: Vec<u8> = Vec::new();
            let mut pipes_open = true;

            // A descendant may keep the pipes open after the adapter
            // itself exits, so exit is watched alongside the output
            let exit = loop {
                tokio::select! {
                    biased;
                    chunk = output.recv(), if pipes_open => match chunk {
                        Some(chunk) => {
                            buffer.extend_from_slice(&chunk);
                            if let Some(handshake) = match_handshake(pattern, &buffer) {
                                return Ok(handshake);
                            }
                        }
                        None => pipes_open = false,
                    },
                    exit = wait_exited(&mut state_rx) => break exit,
                }
            };

            // Pick up output still in flight from the reader tasks
            while let Ok(Some(chunk)) = tokio::time::timeout(EXIT_DRAIN, output.recv()).await {
                buffer.extend_from_slice(&chunk);
            }
            if let Some(handshake) = match_handshake(pattern, &buffer) {
                return Ok(handshake);
            }

            Err(Error::PrematureExit {
                exit,
                output: String::from_utf8_lossy(&buffer).into_owned(),
            })
        };

        match tokio::time::timeout(timeout, detect).await {
            Ok(Ok(handshake)) => {
                info!(parent: &self.span, groups = ?handshake.groups(), "Adapter handshake received");
                Ok(handshake)
            }
            Ok(Err(e)) => {
                warn!(parent: &self.span, error = %e, "Adapter exited during handshake");
                Err(e)
            }
            Err(_) => {
                let millis = timeout.as_millis() as u64;
                warn!(parent: &self.span, timeout_ms = millis, "Adapter handshake timed out");
                self.terminate().await;
                Err(Error::HandshakeTimeout(millis))
            }
        }
    }

    /// Kill the process and wait for it to be reaped
    ///
    /// Safe to call any number of times, including after the process
    /// has already exited.
    pub async fn terminate(&self) -> ExitInfo {
        let kill = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(kill) = kill {
            debug!(parent: &self.span, "Terminating debug adapter");
            let _ = kill.send(());
        }
        self.wait().await
    }
}

fn match_handshake(pattern: &Regex, buffer: &[u8]) -> Option<Handshake> {
    let text = String::from_utf8_lossy(buffer);
    pattern.captures(&text).map(|caps| Handshake::from_captures(&caps))
}

/// Resolve once the watch channel reports an exit
pub(crate) async fn wait_exited(state_rx: &mut watch::Receiver<ProcessState>) -> ExitInfo {
    loop {
        if let ProcessState::Exited(info) = *state_rx.borrow_and_update() {
            return info;
        }
        if state_rx.changed().await.is_err() {
            // Watcher is gone without publishing; treat as exited
            return match *state_rx.borrow() {
                ProcessState::Exited(info) => info,
                ProcessState::Running => ExitInfo::default(),
            };
        }
    }
}

/// Own the child until it exits, killing it on request or when the
/// `AdapterProcess` is dropped
async fn watch_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ProcessState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill failed, process may already be gone");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => exit_info(status),
        Err(e) => {
            warn!(error = %e, "Failed to collect adapter exit status");
            ExitInfo::default()
        }
    };

    info!(exit = %info, "Debug adapter exited");
    state_tx.send_replace(ProcessState::Exited(info));
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

/// Log a pipe's output and forward it to the handshake detector
///
/// Keeps draining after the detector goes away so the adapter never
/// blocks on a full pipe.
fn forward_output<R>(
    mut stream: R,
    name: &'static str,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    span: Span,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        debug!(
                            stream = name,
                            output = %String::from_utf8_lossy(&buf[..n]).trim_end(),
                            "Adapter output"
                        );
                        let _ = tx.send(buf[..n].to_vec());
                    }
                    Err(e) => {
                        debug!(stream = name, error = %e, "Adapter pipe read failed");
                        break;
                    }
                }
            }
        }
        .instrument(span),
    );
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::common::config::DEFAULT_HANDSHAKE;
    use std::time::Instant;

    fn sh(script: &str) -> AdapterProcess {
        AdapterProcess::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
        )
        .unwrap()
    }

    fn port_pattern() -> Regex {
        regex::RegexBuilder::new(r"^Listening on port (\d+)")
            .multi_line(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_resolves_with_port() {
        let process = sh("sleep 0.05; echo 'Listening on port 4711'; sleep 5");

        let started = Instant::now();
        let handshake = process
            .await_handshake(&port_pattern(), Duration::from_millis(1000))
            .await
            .unwrap();

        assert_eq!(handshake.group(1), Some("4711"));
        assert_eq!(handshake.port().unwrap(), 4711);
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(process.is_alive());

        process.terminate().await;
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_handshake_times_out_and_kills() {
        let process = sh("sleep 0.05; echo 'Listening on port 4711'; sleep 5");

        let err = process
            .await_handshake(&port_pattern(), Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HandshakeTimeout(10)));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_handshake_split_across_writes() {
        let process = sh("printf 'Listen'; sleep 0.05; printf 'ing on port 9'; sleep 0.05; printf '12\\n'; sleep 5");
        let pattern = regex::RegexBuilder::new(DEFAULT_HANDSHAKE)
            .multi_line(true)
            .build()
            .unwrap();

        let handshake = process
            .await_handshake(&pattern, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(handshake.port().unwrap(), 912);
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_handshake_on_stderr() {
        let process = sh("echo 'Listening on port 5005' 1>&2; sleep 5");
        let handshake = process
            .await_handshake(&port_pattern(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(handshake.port().unwrap(), 5005);
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_premature_exit_keeps_output() {
        let process = sh("echo 'cannot load liblldb'; exit 3");

        let err = process
            .await_handshake(&port_pattern(), Duration::from_secs(2))
            .await
            .unwrap_err();

        match err {
            Error::PrematureExit { exit, output } => {
                assert_eq!(exit.code, Some(3));
                assert!(output.contains("cannot load liblldb"));
            }
            other => panic!("expected PrematureExit, got {other:?}"),
        }
        assert_eq!(process.exit_info().map(|i| i.code), Some(Some(3)));
    }

    #[tokio::test]
    async fn test_exit_detected_while_descendant_holds_pipes() {
        let process = sh("echo 'cannot load'; sleep 3 & exit 3");

        let started = Instant::now();
        let err = process
            .await_handshake(&port_pattern(), Duration::from_millis(1500))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(1000));
        match err {
            Error::PrematureExit { exit, output } => {
                assert_eq!(exit.code, Some(3));
                assert!(output.contains("cannot load"));
            }
            other => panic!("expected PrematureExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let process = sh("sleep 5");
        let mut exits = process.subscribe();

        let first = process.terminate().await;
        let second = process.terminate().await;

        assert_eq!(first, second);
        assert_eq!(first.signal, Some(9));
        assert!(matches!(*exits.borrow_and_update(), ProcessState::Exited(_)));
    }

    #[tokio::test]
    async fn test_terminate_after_natural_exit() {
        let process = sh("exit 0");
        let info = process.wait().await;
        assert_eq!(info.code, Some(0));
        assert_eq!(process.terminate().await, info);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let err = AdapterProcess::spawn(
            Path::new("/nonexistent/adapter"),
            &[],
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_environment_is_expanded() {
        let config = AdapterConfig {
            path: "/bin/sh".into(),
            args: vec!["-c".to_string(), "echo \"Listening on port $PORT_FROM_ENV\"; sleep 5".to_string()],
            env: HashMap::from([("PORT_FROM_ENV".to_string(), "${env:HARNESS_TEST_PORT}".to_string())]),
            handshake: DEFAULT_HANDSHAKE.to_string(),
        };
        let expander = Expander::with_env(HashMap::from([(
            "HARNESS_TEST_PORT".to_string(),
            "6006".to_string(),
        )]));

        let process = AdapterProcess::from_config(&config, &expander).unwrap();
        let handshake = process
            .await_handshake(&config.handshake_regex().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(handshake.port().unwrap(), 6006);
        process.terminate().await;
    }
}
