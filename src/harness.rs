//! A debuggee under test
//!
//! Ties one adapter process to one session: spawn, handshake, connect,
//! launch or attach, then follow stops until the debuggee exits.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, Instrument};

use crate::common::config::Config;
use crate::common::{Error, ExitInfo, Result};
use crate::dap::{
    Capabilities, DapSession, EventSubscription, ExitedEventBody, SessionOptions, StackFrame,
    StartOptions, StoppedEventBody,
};
use crate::inspect::VariableTree;
use crate::launch::{RequestKind, ResolvedLaunch};
use crate::supervisor::AdapterProcess;

/// Where the debuggee last stopped
#[derive(Debug, Clone)]
pub struct StopInfo {
    pub reason: String,
    pub thread_id: i64,
    /// Innermost frame, when the adapter reported one
    pub frame: Option<StackFrame>,
}

impl StopInfo {
    /// `file:line` of the innermost frame
    pub fn location(&self) -> String {
        match &self.frame {
            Some(frame) => {
                let file = frame
                    .source
                    .as_ref()
                    .and_then(|s| s.path.as_deref().or(s.name.as_deref()))
                    .unwrap_or("<unknown>");
                format!("{} in {}:{}", frame.name, file, frame.line)
            }
            None => "unknown location".to_string(),
        }
    }
}

/// A running debug adapter with a configured debuggee
pub struct Harness {
    process: AdapterProcess,
    session: DapSession,
    capabilities: Capabilities,
    stops: EventSubscription,
    exits: EventSubscription,
    terminations: EventSubscription,
    last_stop: Option<StopInfo>,
    max_depth: usize,
    request_timeout: Duration,
}

impl Harness {
    /// Spawn the configured adapter and start the debuggee
    pub async fn start(config: &Config, process: AdapterProcess, launch: &ResolvedLaunch) -> Result<Self> {
        let span = process.span().clone();
        let timeouts = &config.timeouts;

        let pattern = config.adapter.handshake_regex()?;
        let handshake = match process.await_handshake(&pattern, timeouts.handshake()).await {
            Ok(handshake) => handshake,
            Err(e) => {
                process.terminate().await;
                return Err(e);
            }
        };
        let port = handshake.port()?;

        let options = SessionOptions {
            request_timeout: Some(timeouts.request()),
            span: tracing::info_span!(parent: &span, "dap_session", port),
        };
        let session = match DapSession::connect(&process, port, timeouts.connect(), options).await {
            Ok(session) => session,
            Err(e) => {
                process.terminate().await;
                return Err(e);
            }
        };

        // Subscribe before launching so no stop or exit can slip past
        let stops = session.subscribe("stopped");
        let exits = session.subscribe("exited");
        let terminations = session.subscribe("terminated");

        let start = StartOptions {
            initialized_timeout: timeouts.initialize(),
            breakpoints: launch.breakpoints.clone(),
            ..Default::default()
        };
        let started = match launch.request {
            RequestKind::Launch => session.launch(launch.arguments.clone(), &start).await,
            RequestKind::Attach => session.attach(launch.arguments.clone(), &start).await,
        };
        let capabilities = match started {
            Ok(capabilities) => capabilities,
            Err(e) => {
                session.shutdown().await;
                process.terminate().await;
                return Err(e);
            }
        };

        info!(parent: &span, request = launch.request.command(), "Debuggee started");

        Ok(Self {
            process,
            session,
            capabilities,
            stops,
            exits,
            terminations,
            last_stop: None,
            max_depth: config.inspector.max_depth,
            request_timeout: timeouts.request(),
        })
    }

    pub fn session(&self) -> &DapSession {
        &self.session
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn last_stop(&self) -> Option<&StopInfo> {
        self.last_stop.as_ref()
    }

    /// Variable tree inspector bounded by the configured depth
    pub fn variables(&self) -> VariableTree<'_> {
        VariableTree::new(&self.session).with_max_depth(self.max_depth)
    }

    /// Wait for the next user-visible stop
    pub async fn await_stop(&mut self, limit: Duration) -> Result<&StopInfo> {
        let next = next_stop(&mut self.stops, &mut self.terminations);
        let body = tokio::time::timeout(limit, next)
            .await
            .map_err(|_| Error::timeout("await stop", limit.as_millis() as u64))??;

        let stopped: StoppedEventBody = serde_json::from_value(body)
            .map_err(|e| Error::DapProtocol(format!("Malformed 'stopped' event: {}", e)))?;
        let thread_id = match stopped.thread_id {
            Some(id) => id,
            None => self
                .session
                .threads()
                .await?
                .first()
                .map(|t| t.id)
                .ok_or_else(|| Error::dap_request_failed("threads", "no threads"))?,
        };
        let frame = self
            .session
            .stack_trace(thread_id, Some(1))
            .await?
            .into_iter()
            .next();

        let stop = StopInfo {
            reason: stopped.reason,
            thread_id,
            frame,
        };
        info!(parent: self.session.span(), reason = %stop.reason, location = %stop.location(), "Debuggee stopped");
        Ok(self.last_stop.insert(stop))
    }

    /// Thread of the last stop
    pub fn stopped_thread(&self) -> Result<i64> {
        self.last_stop
            .as_ref()
            .map(|s| s.thread_id)
            .ok_or_else(|| Error::TestAssertion("debuggee has not stopped yet".to_string()))
    }

    /// Frame id of a frame of the stopped thread
    pub async fn frame_id(&self, frame_index: usize) -> Result<i64> {
        let thread_id = self.stopped_thread()?;
        let frames = self
            .session
            .stack_trace(thread_id, Some(frame_index as i64 + 1))
            .await?;
        frames.get(frame_index).map(|f| f.id).ok_or_else(|| {
            Error::dap_request_failed("stackTrace", &format!("no frame {}", frame_index))
        })
    }

    /// Locals container of a frame of the stopped thread
    pub async fn locals(&self, frame_index: usize) -> Result<i64> {
        self.variables()
            .frame_locals(self.stopped_thread()?, frame_index)
            .await
    }

    /// Resume the stopped thread
    pub async fn resume(&mut self) -> Result<()> {
        let thread_id = self.stopped_thread()?;
        self.session.continue_execution(thread_id).await?;
        self.last_stop = None;
        Ok(())
    }

    /// Wait for the debuggee to exit and return its exit code
    pub async fn await_exit(&mut self, limit: Duration) -> Result<i32> {
        let body = tokio::time::timeout(limit, self.exits.next())
            .await
            .map_err(|_| Error::timeout("await exit", limit.as_millis() as u64))?
            .ok_or_else(|| Error::SessionTerminated("session ended before 'exited'".to_string()))?;
        let exited: ExitedEventBody = serde_json::from_value(body)
            .map_err(|e| Error::DapProtocol(format!("Malformed 'exited' event: {}", e)))?;
        Ok(exited.exit_code)
    }

    /// Evaluate in a frame of the stopped thread
    pub async fn evaluate(&self, expression: &str, frame_index: usize) -> Result<Value> {
        let frame_id = self.frame_id(frame_index).await?;
        let result = self.session.evaluate(expression, Some(frame_id), "watch").await?;
        Ok(serde_json::to_value(result)?)
    }

    /// Disconnect and stop the adapter
    pub async fn shutdown(self) -> ExitInfo {
        let span = self.process.span().clone();
        async {
            tokio::time::timeout(self.request_timeout, self.session.shutdown())
                .await
                .ok();
            self.process.terminate().await
        }
        .instrument(span)
        .await
    }
}

/// Next `stopped` body, unless the debuggee terminates first
///
/// A stop that arrived before the termination is still reported.
async fn next_stop(
    stops: &mut EventSubscription,
    terminations: &mut EventSubscription,
) -> Result<Value> {
    tokio::select! {
        biased;
        body = stops.next() => body.ok_or_else(|| {
            Error::SessionTerminated("session ended while waiting for a stop".to_string())
        }),
        _ = terminations.next() => Err(Error::SessionTerminated(
            "debuggee terminated while waiting for a stop".to_string(),
        )),
    }
}
