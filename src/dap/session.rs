//! DAP client session
//!
//! One reader task owns the incoming half of the connection and routes
//! every message: responses to the request waiting on their `seq`, events
//! to registered waiters and subscriptions. Outgoing messages go through a
//! writer task, so callers never hold a lock across I/O.
//!
//! Every pending request and event waiter resolves exactly once: with its
//! result, with a timeout (which removes the registration) or with
//! `SessionTerminated` when the connection or adapter process goes away.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::common::{Error, ExitInfo, Result};
use crate::launch::{BreakpointLocation, RequestKind};
use crate::supervisor::{self, AdapterProcess, ProcessState};

use super::codec;
use super::types::*;

/// How long `shutdown` waits for the disconnect response
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing sent yet
    Created,
    /// `initialize` sent, waiting for the `initialized` event
    Initializing,
    /// Adapter accepts configuration and inspection requests
    Ready,
    /// Connection closed; every request fails
    Terminated,
}

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Applied to every request unless a call passes its own
    pub request_timeout: Option<Duration>,
    /// Parent span for everything the session logs
    pub span: Span,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            span: tracing::info_span!("dap_session"),
        }
    }
}

/// Settings for the launch/attach start-up sequence
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// `adapterID` sent with `initialize`
    pub adapter_id: String,
    /// Deadline for the `initialized` event
    pub initialized_timeout: Duration,
    /// Breakpoints set before `configurationDone`
    pub breakpoints: Vec<BreakpointLocation>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            adapter_id: InitializeArguments::default().adapter_id,
            initialized_timeout: Duration::from_secs(10),
            breakpoints: Vec::new(),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone)]
enum CloseReason {
    Disconnected(String),
    ProcessExited(ExitInfo),
    Protocol(String),
    Shutdown,
}

impl CloseReason {
    fn describe(&self) -> String {
        match self {
            Self::Disconnected(reason) => reason.clone(),
            Self::ProcessExited(exit) => format!("debug adapter exited ({})", exit),
            Self::Protocol(reason) => format!("protocol error: {}", reason),
            Self::Shutdown => "session shut down".to_string(),
        }
    }

    /// Error handed to requests that were still in flight
    fn in_flight_error(&self) -> Error {
        match self {
            Self::Protocol(reason) => Error::DapProtocol(reason.clone()),
            other => Error::SessionTerminated(other.describe()),
        }
    }
}

/// Predicate applied to an event body
type EventFilter = Box<dyn Fn(&Value) -> bool + Send>;

struct PendingRequest {
    command: String,
    slot: oneshot::Sender<Result<Value>>,
}

enum WaiterSlot {
    Once(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<Value>),
}

struct EventWaiter {
    id: u64,
    event: String,
    filter: EventFilter,
    slot: WaiterSlot,
}

struct Tables {
    next_seq: i64,
    next_waiter: u64,
    pending: HashMap<i64, PendingRequest>,
    waiters: Vec<EventWaiter>,
    /// Writer task queue; `None` once closed
    outgoing: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    closed: Option<CloseReason>,
}

/// State shared between the session handle, its tasks and waiters
struct Shared {
    tables: Mutex<Tables>,
    state: watch::Sender<SessionState>,
    span: Span,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminated_error(tables: &Tables) -> Error {
        let reason = tables
            .closed
            .as_ref()
            .map(CloseReason::describe)
            .unwrap_or_else(|| "session closed".to_string());
        Error::SessionTerminated(reason)
    }

    /// Allocate a seq, register the pending entry and queue the request
    ///
    /// All under one lock, so requests hit the wire in seq order.
    fn register_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<(i64, oneshot::Receiver<Result<Value>>)> {
        let mut tables = self.tables();
        let outgoing = match (&tables.closed, &tables.outgoing) {
            (None, Some(outgoing)) => outgoing.clone(),
            _ => return Err(Self::terminated_error(&tables)),
        };

        let seq = tables.next_seq;
        tables.next_seq += 1;

        let (tx, rx) = oneshot::channel();
        tables.pending.insert(
            seq,
            PendingRequest {
                command: command.to_string(),
                slot: tx,
            },
        );

        let message = ProtocolMessage::Request(RequestMessage {
            seq,
            command: command.to_string(),
            arguments,
        });
        if outgoing.send(message).is_err() {
            tables.pending.remove(&seq);
            return Err(Self::terminated_error(&tables));
        }

        debug!(parent: &self.span, command, seq, "Sent DAP request");
        Ok((seq, rx))
    }

    fn remove_pending(&self, seq: i64) {
        self.tables().pending.remove(&seq);
    }

    fn register_waiter(&self, event: &str, filter: EventFilter, slot: WaiterSlot) -> Option<u64> {
        let mut tables = self.tables();
        if tables.closed.is_some() {
            return None;
        }
        let id = tables.next_waiter;
        tables.next_waiter += 1;
        tables.waiters.push(EventWaiter {
            id,
            event: event.to_string(),
            filter,
            slot,
        });
        Some(id)
    }

    fn remove_waiter(&self, id: u64) {
        self.tables().waiters.retain(|w| w.id != id);
    }

    fn dispatch(&self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Response(response) => self.dispatch_response(response),
            ProtocolMessage::Event(event) => self.dispatch_event(event),
            ProtocolMessage::Request(request) => self.refuse_reverse_request(request),
        }
    }

    fn dispatch_response(&self, response: ResponseMessage) {
        let pending = self.tables().pending.remove(&response.request_seq);
        let Some(pending) = pending else {
            debug!(
                parent: &self.span,
                request_seq = response.request_seq,
                command = %response.command,
                "Response for unknown or abandoned request"
            );
            return;
        };

        let result = if response.success {
            Ok(response.body.unwrap_or(Value::Null))
        } else {
            Err(Error::dap_request_failed(
                &pending.command,
                &response.error_message(),
            ))
        };

        trace!(parent: &self.span, command = %pending.command, seq = response.request_seq, "Response received");
        let _ = pending.slot.send(result);
    }

    fn dispatch_event(&self, event: EventMessage) {
        let body = event.body.unwrap_or(Value::Null);

        if event.event == "initialized" {
            self.state.send_if_modified(|state| {
                if matches!(state, SessionState::Created | SessionState::Initializing) {
                    *state = SessionState::Ready;
                    true
                } else {
                    false
                }
            });
        }

        // The entry stop is reported before configuration is complete and
        // is never a breakpoint anyone waits for
        if event.event == "stopped" && body.get("reason").and_then(Value::as_str) == Some("initial")
        {
            debug!(parent: &self.span, "Ignoring initial stop");
            return;
        }

        debug!(parent: &self.span, event = %event.event, "Event received");

        let mut tables = self.tables();
        let mut index = 0;
        while index < tables.waiters.len() {
            let waiter = &tables.waiters[index];
            if waiter.event != event.event || !(waiter.filter)(&body) {
                index += 1;
                continue;
            }

            match &waiter.slot {
                WaiterSlot::Stream(tx) => {
                    if tx.send(body.clone()).is_err() {
                        tables.waiters.remove(index);
                    } else {
                        index += 1;
                    }
                }
                WaiterSlot::Once(_) => {
                    let waiter = tables.waiters.remove(index);
                    if let WaiterSlot::Once(tx) = waiter.slot {
                        let _ = tx.send(Ok(body.clone()));
                    }
                }
            }
        }
    }

    /// Adapter-initiated requests (runInTerminal and friends) are not
    /// supported; answer them so the adapter is not left waiting
    fn refuse_reverse_request(&self, request: RequestMessage) {
        warn!(parent: &self.span, command = %request.command, "Refusing reverse request");
        let mut tables = self.tables();
        let seq = tables.next_seq;
        tables.next_seq += 1;
        if let Some(outgoing) = &tables.outgoing {
            let _ = outgoing.send(ProtocolMessage::Response(ResponseMessage {
                seq,
                request_seq: request.seq,
                success: false,
                command: request.command,
                message: Some("not supported".to_string()),
                body: None,
            }));
        }
    }

    /// Fail everything outstanding and mark the session terminated
    ///
    /// Only the first call has any effect.
    fn close(&self, reason: CloseReason) {
        let (pending, waiters) = {
            let mut tables = self.tables();
            if tables.closed.is_some() {
                return;
            }
            tables.closed = Some(reason.clone());
            tables.outgoing = None;
            (
                std::mem::take(&mut tables.pending),
                std::mem::take(&mut tables.waiters),
            )
        };

        match &reason {
            CloseReason::Shutdown => info!(parent: &self.span, "DAP session closed"),
            CloseReason::Protocol(_) => {
                error!(parent: &self.span, reason = %reason.describe(), "DAP session failed")
            }
            _ => warn!(parent: &self.span, reason = %reason.describe(), "DAP session terminated"),
        }

        for (_, request) in pending {
            let _ = request.slot.send(Err(reason.in_flight_error()));
        }
        for waiter in waiters {
            // Dropping a stream sender ends the subscription
            if let WaiterSlot::Once(tx) = waiter.slot {
                let _ = tx.send(Err(Error::SessionTerminated(reason.describe())));
            }
        }

        self.state.send_replace(SessionState::Terminated);
    }
}

/// Future for a single matching event
///
/// The waiter is registered when this is created, not when it is first
/// polled, so an event arriving between creation and the first poll is
/// not lost. Dropping it removes the registration.
#[must_use = "the waiter is removed when this is dropped"]
pub struct EventWait {
    rx: oneshot::Receiver<Result<Value>>,
    registration: Option<(Arc<Shared>, u64)>,
    event: String,
}

impl EventWait {
    /// Wait at most `limit` for the event
    pub async fn timeout(self, limit: Duration) -> Result<Value> {
        let operation = format!("wait for '{}' event", self.event);
        tokio::time::timeout(limit, self)
            .await
            .map_err(|_| Error::timeout(&operation, limit.as_millis() as u64))?
    }

    /// Wait for the event and decode its body
    pub async fn decode<T: DeserializeOwned>(self, limit: Duration) -> Result<T> {
        let event = self.event.clone();
        let body = self.timeout(limit).await?;
        serde_json::from_value(body)
            .map_err(|e| Error::DapProtocol(format!("Malformed '{}' event: {}", event, e)))
    }
}

impl Future for EventWait {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::SessionTerminated("session dropped".to_string()))
            })
        })
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Some((shared, id)) = self.registration.take() {
            shared.remove_waiter(id);
        }
    }
}

/// Every occurrence of one event, until dropped or the session ends
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<Value>,
    registration: Option<(Arc<Shared>, u64)>,
}

impl EventSubscription {
    /// Next event body, or `None` once the session has terminated
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some((shared, id)) = self.registration.take() {
            shared.remove_waiter(id);
        }
    }
}

/// Removes a pending entry when a request is abandoned
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove_pending(self.seq);
    }
}

/// Client side of a DAP connection
pub struct DapSession {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    exit_rx: Option<watch::Receiver<ProcessState>>,
    request_timeout: Option<Duration>,
    reader: JoinHandle<()>,
}

impl DapSession {
    /// Start a session over any byte stream pair
    pub fn new<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, None, options)
    }

    /// Start a session bound to an adapter process
    ///
    /// When the process exits, every outstanding request fails with
    /// `SessionTerminated`.
    pub fn with_process<R, W>(
        reader: R,
        writer: W,
        process: &AdapterProcess,
        options: SessionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, Some(process.subscribe()), options)
    }

    /// Connect to the port an adapter announced
    pub async fn connect(
        process: &AdapterProcess,
        port: u16,
        connect_timeout: Duration,
        options: SessionOptions,
    ) -> Result<Self> {
        let stream: TcpStream = supervisor::transport::connect(port, connect_timeout).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::with_process(reader, writer, process, options))
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        exit_rx: Option<watch::Receiver<ProcessState>>,
        options: SessionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Created);

        let shared = Arc::new(Shared {
            tables: Mutex::new(Tables {
                next_seq: 1,
                next_waiter: 0,
                pending: HashMap::new(),
                waiters: Vec::new(),
                outgoing: Some(outgoing_tx),
                closed: None,
            }),
            state: state_tx,
            span: options.span.clone(),
        });

        tokio::spawn(write_loop(writer, outgoing_rx, shared.clone()).instrument(options.span.clone()));
        let reader = tokio::spawn(
            read_loop(reader, shared.clone(), exit_rx.clone()).instrument(options.span),
        );

        Self {
            shared,
            state_rx,
            exit_rx,
            request_timeout: options.request_timeout,
            reader,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// Diagnostics span of this session
    pub fn span(&self) -> &Span {
        &self.shared.span
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Fail fast when the adapter is already known to be gone
    fn check_process(&self) {
        if let Some(exit_rx) = &self.exit_rx {
            if let ProcessState::Exited(exit) = *exit_rx.borrow() {
                self.shared.close(CloseReason::ProcessExited(exit));
            }
        }
    }

    // === Requests ===

    /// Send a request and wait for its response body
    pub async fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.send_request_with_timeout(command, arguments, self.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline (`None` waits forever)
    pub async fn send_request_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.check_process();
        let (seq, rx) = self.shared.register_request(command, arguments)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            seq,
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(parent: &self.shared.span, command, seq, "DAP request timed out");
                    return Err(Error::timeout(command, limit.as_millis() as u64));
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| Err(Shared::terminated_error(&self.shared.tables())))
    }

    /// Send a request and decode the response body
    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        let body = self.send_request(command, arguments).await?;
        serde_json::from_value(body)
            .map_err(|e| Error::DapProtocol(format!("Malformed '{}' response: {}", command, e)))
    }

    // === Events ===

    /// Register interest in the next matching event
    ///
    /// Register before sending the request that triggers the event:
    /// ```ignore
    /// let stopped = session.wait_for_event("stopped", |_| true);
    /// session.continue_execution(thread_id).await?;
    /// let body = stopped.await?;
    /// ```
    pub fn wait_for_event<F>(&self, event: &str, filter: F) -> EventWait
    where
        F: Fn(&Value) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let registration = self
            .shared
            .register_waiter(event, Box::new(filter), WaiterSlot::Once(tx));

        let registration = match registration {
            Some(id) => Some((self.shared.clone(), id)),
            None => {
                // Already closed; resolve immediately
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(Shared::terminated_error(&self.shared.tables())));
                return EventWait {
                    rx,
                    registration: None,
                    event: event.to_string(),
                };
            }
        };

        EventWait {
            rx,
            registration,
            event: event.to_string(),
        }
    }

    /// Wait for the next matching event within `limit`
    pub async fn wait_for_event_timeout<F>(
        &self,
        event: &str,
        filter: F,
        limit: Duration,
    ) -> Result<Value>
    where
        F: Fn(&Value) -> bool + Send + 'static,
    {
        self.wait_for_event(event, filter).timeout(limit).await
    }

    /// Receive every occurrence of an event
    pub fn subscribe(&self, event: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self
            .shared
            .register_waiter(event, Box::new(|_| true), WaiterSlot::Stream(tx))
            .map(|id| (self.shared.clone(), id));
        EventSubscription { rx, registration }
    }

    // === Start-up ===

    /// Send `initialize` and return the adapter's capabilities
    pub async fn initialize(&self, adapter_id: &str) -> Result<Capabilities> {
        let arguments = InitializeArguments {
            adapter_id: adapter_id.to_string(),
            ..Default::default()
        };
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Initializing;
                true
            } else {
                false
            }
        });
        let capabilities: Option<Capabilities> =
            self.request("initialize", Some(to_value(&arguments)?)).await?;
        Ok(capabilities.unwrap_or_default())
    }

    /// Full launch sequence
    ///
    /// `initialize`, then `launch` while waiting for `initialized`, then
    /// initial breakpoints and `configurationDone`.
    pub async fn launch(&self, arguments: Value, options: &StartOptions) -> Result<Capabilities> {
        self.start_debuggee(RequestKind::Launch, arguments, options).await
    }

    /// Full attach sequence; see [`DapSession::launch`]
    pub async fn attach(&self, arguments: Value, options: &StartOptions) -> Result<Capabilities> {
        self.start_debuggee(RequestKind::Attach, arguments, options).await
    }

    async fn start_debuggee(
        &self,
        kind: RequestKind,
        arguments: Value,
        options: &StartOptions,
    ) -> Result<Capabilities> {
        // The event may arrive before the initialize response
        let initialized = self.wait_for_event("initialized", |_| true);

        let capabilities = self.initialize(&options.adapter_id).await?;
        info!(parent: &self.shared.span, request = kind.command(), "Debug adapter initialized");

        let limit = options.initialized_timeout;
        let initialized = async move {
            match tokio::time::timeout(limit, initialized).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(Error::Handshake(format!(
                    "no 'initialized' event within {} ms",
                    limit.as_millis()
                ))),
            }
        };
        let start = self.request::<Value>(kind.command(), Some(arguments));
        tokio::try_join!(initialized, start)?;

        self.set_initial_breakpoints(&options.breakpoints).await?;
        self.configuration_done().await?;

        info!(parent: &self.shared.span, "Debuggee configured");
        Ok(capabilities)
    }

    async fn set_initial_breakpoints(&self, locations: &[BreakpointLocation]) -> Result<()> {
        let mut by_file: Vec<(String, Vec<SourceBreakpoint>)> = Vec::new();
        let mut functions = Vec::new();

        for location in locations {
            match location {
                BreakpointLocation::Line { file, line } => {
                    let path = file.display().to_string();
                    let breakpoint = SourceBreakpoint {
                        line: *line,
                        condition: None,
                    };
                    match by_file.iter_mut().find(|(p, _)| *p == path) {
                        Some((_, lines)) => lines.push(breakpoint),
                        None => by_file.push((path, vec![breakpoint])),
                    }
                }
                BreakpointLocation::Function { name } => functions.push(FunctionBreakpoint {
                    name: name.clone(),
                    condition: None,
                }),
            }
        }

        for (path, breakpoints) in by_file {
            let set = self.set_breakpoints(&path, breakpoints).await?;
            for bp in set.iter().filter(|bp| !bp.verified) {
                warn!(parent: &self.shared.span, file = %path, line = ?bp.line, message = ?bp.message, "Breakpoint not verified");
            }
        }
        if !functions.is_empty() {
            self.set_function_breakpoints(functions).await?;
        }
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.send_request("configurationDone", None).await?;
        Ok(())
    }

    // === Breakpoints ===

    /// Replace all line breakpoints in one file
    pub async fn set_breakpoints(
        &self,
        path: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<Vec<Breakpoint>> {
        let arguments = SetBreakpointsArguments {
            source: Source {
                name: None,
                path: Some(path.to_string()),
                source_reference: None,
            },
            breakpoints,
        };
        let body: SetBreakpointsResponseBody = self
            .request("setBreakpoints", Some(to_value(&arguments)?))
            .await?;
        Ok(body.breakpoints)
    }

    /// Replace all function breakpoints
    pub async fn set_function_breakpoints(
        &self,
        breakpoints: Vec<FunctionBreakpoint>,
    ) -> Result<Vec<Breakpoint>> {
        let arguments = SetFunctionBreakpointsArguments { breakpoints };
        let body: SetBreakpointsResponseBody = self
            .request("setFunctionBreakpoints", Some(to_value(&arguments)?))
            .await?;
        Ok(body.breakpoints)
    }

    // === Inspection ===

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        let body: ThreadsResponseBody = self.request("threads", None).await?;
        Ok(body.threads)
    }

    pub async fn stack_trace(&self, thread_id: i64, levels: Option<i64>) -> Result<Vec<StackFrame>> {
        let arguments = StackTraceArguments {
            thread_id,
            start_frame: Some(0),
            levels,
        };
        let body: StackTraceResponseBody = self
            .request("stackTrace", Some(to_value(&arguments)?))
            .await?;
        Ok(body.stack_frames)
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let arguments = ScopesArguments { frame_id };
        let body: ScopesResponseBody = self.request("scopes", Some(to_value(&arguments)?)).await?;
        Ok(body.scopes)
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        let arguments = VariablesArguments {
            variables_reference,
            start: None,
            count: None,
        };
        let body: VariablesResponseBody = self
            .request("variables", Some(to_value(&arguments)?))
            .await?;
        Ok(body.variables)
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<SetVariableResponseBody> {
        let arguments = SetVariableArguments {
            variables_reference,
            name: name.to_string(),
            value: value.to_string(),
        };
        self.request("setVariable", Some(to_value(&arguments)?)).await
    }

    /// Evaluate an expression, optionally in a frame
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateResponseBody> {
        let arguments = EvaluateArguments {
            expression: expression.to_string(),
            frame_id,
            context: Some(context.to_string()),
        };
        self.request("evaluate", Some(to_value(&arguments)?)).await
    }

    /// Text of a source known only by reference
    pub async fn source(&self, source_reference: i64) -> Result<String> {
        let arguments = SourceArguments {
            source: None,
            source_reference,
        };
        let body: SourceResponseBody = self.request("source", Some(to_value(&arguments)?)).await?;
        Ok(body.content)
    }

    // === Execution ===

    /// Resume a thread; returns whether all threads were continued
    pub async fn continue_execution(&self, thread_id: i64) -> Result<bool> {
        let arguments = ContinueArguments {
            thread_id,
            single_thread: false,
        };
        let body: Option<ContinueResponseBody> = self
            .request("continue", Some(to_value(&arguments)?))
            .await?;
        Ok(body.map(|b| b.all_threads_continued).unwrap_or(true))
    }

    // === Shutdown ===

    pub async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        let arguments = DisconnectArguments {
            restart: false,
            terminate_debuggee: Some(terminate_debuggee),
        };
        self.send_request_with_timeout(
            "disconnect",
            Some(to_value(&arguments)?),
            Some(DISCONNECT_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    /// Disconnect if still connected, then close the session
    pub async fn shutdown(&self) {
        if !self.is_terminated() {
            match self.disconnect(true).await {
                Ok(()) | Err(Error::SessionTerminated(_)) => {}
                Err(e) => debug!(parent: &self.shared.span, error = %e, "Disconnect failed"),
            }
        }
        self.shared.close(CloseReason::Shutdown);
        self.reader.abort();
    }
}

impl Drop for DapSession {
    fn drop(&mut self) {
        self.shared.close(CloseReason::Shutdown);
        self.reader.abort();
    }
}

fn to_value<T: Serialize>(arguments: &T) -> Result<Value> {
    Ok(serde_json::to_value(arguments)?)
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<ProtocolMessage>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = codec::write_message(&mut writer, &message).await {
            shared.close(CloseReason::Disconnected(format!("write failed: {}", e)));
            break;
        }
    }
}

async fn read_loop<R>(
    reader: R,
    shared: Arc<Shared>,
    mut exit_rx: Option<watch::Receiver<ProcessState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);

    let reason = loop {
        let message = tokio::select! {
            biased;
            message = codec::read_message(&mut reader) => message,
            exit = process_exit(&mut exit_rx) => break CloseReason::ProcessExited(exit),
        };

        match message {
            Ok(message) => shared.dispatch(message),
            Err(Error::DapProtocol(reason)) => break CloseReason::Protocol(reason),
            Err(Error::SessionTerminated(reason)) => break CloseReason::Disconnected(reason),
            Err(e) => break CloseReason::Disconnected(e.to_string()),
        }
    };

    shared.close(reason);
}

async fn process_exit(exit_rx: &mut Option<watch::Receiver<ProcessState>>) -> ExitInfo {
    match exit_rx {
        Some(rx) => supervisor::wait_exited(rx).await,
        None => std::future::pending().await,
    }
}
