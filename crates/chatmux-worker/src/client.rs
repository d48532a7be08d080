//! RPC client for a single worker process.
//!
//! One client owns one worker: it serializes commands onto the worker's
//! stdin, demultiplexes response and event lines from its stdout, and
//! escalates SIGTERM to SIGKILL on close.

use crate::error::WorkerError;
use crate::protocol::{self, LineBuffer, WorkerLine};
use crate::Result;
use chatmux_core::config::WorkerConfig;
use chatmux_core::types::{WorkerCommand, WorkerEvent, WorkerResponse};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Events buffered per turn before the reader applies backpressure to the
/// worker's stdout.
const TURN_EVENT_BUFFER: usize = 256;

/// Tuning knobs for one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Timeout for control commands (ping, abort).
    pub request_timeout: Duration,

    /// Idle timeout for a streaming turn: no event within this window
    /// aborts the turn without tearing down the client.
    pub turn_idle_timeout: Duration,

    /// Grace window between SIGTERM and SIGKILL on close.
    pub kill_grace: Duration,

    /// Stderr lines retained for crash diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            turn_idle_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(2),
            stderr_tail_lines: 40,
        }
    }
}

impl ClientOptions {
    /// Derive options from the worker configuration.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            turn_idle_timeout: config.turn_timeout(),
            ..Self::default()
        }
    }
}

/// State shared between the client handle and its I/O tasks.
struct Shared {
    id: String,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value>>>>,
    turn: Mutex<Option<mpsc::Sender<WorkerEvent>>>,
    stderr_tail: Mutex<VecDeque<String>>,
    closed: AtomicBool,
    exited: AtomicBool,
    exit_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Shared {
    fn new(id: String, exit_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            id,
            pending: Mutex::new(HashMap::new()),
            turn: Mutex::new(None),
            stderr_tail: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            exit_tx,
        }
    }

    async fn resolve_response(&self, response: WorkerResponse) {
        let sender = self.pending.lock().await.remove(&response.id);
        match sender {
            Some(tx) => {
                let result = if response.ok {
                    Ok(response.data.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(WorkerError::Rpc(
                        response
                            .error
                            .unwrap_or_else(|| "unknown worker error".to_string()),
                    ))
                };
                let _ = tx.send(result);
            }
            None => {
                warn!(client = %self.id, request = %response.id, "response for unknown request")
            }
        }
    }

    async fn deliver_event(&self, event: WorkerEvent) {
        let terminal = event.is_terminal();
        // a full channel must not stall while holding the turn lock; the
        // stream's timeout branch takes the same lock
        let tx = {
            let mut turn = self.turn.lock().await;
            if terminal {
                turn.take()
            } else {
                turn.clone()
            }
        };
        match tx {
            Some(tx) => {
                if tx.send(event).await.is_err() && !terminal {
                    let mut turn = self.turn.lock().await;
                    if turn.as_ref().is_some_and(|t| t.same_channel(&tx)) {
                        turn.take();
                    }
                }
            }
            None => debug!(client = %self.id, "dropping event outside a turn"),
        }
    }

    async fn fail_all_pending<F>(&self, make_error: F)
    where
        F: Fn() -> WorkerError,
    {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(make_error()));
        }
    }

    async fn stderr_summary(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            "worker stream closed".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
        }
    }

    /// Invoked once when the worker's stdout reaches EOF or errors.
    async fn on_stream_closed(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.turn.lock().await.take();

        if self.closed.load(Ordering::SeqCst) {
            self.fail_all_pending(|| WorkerError::ClientClosed).await;
        } else {
            let summary = self.stderr_summary().await;
            warn!(client = %self.id, "worker stream closed unexpectedly: {}", summary);
            self.fail_all_pending(|| WorkerError::WorkerCrashed(summary.clone()))
                .await;
            if let Some(tx) = &self.exit_tx {
                let _ = tx.send(self.id.clone());
            }
        }
    }
}

/// RPC client for one worker.
pub struct RpcClient {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    options: ClientOptions,
    req_counter: AtomicU64,
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
    kill_tx: Option<mpsc::Sender<()>>,
}

impl RpcClient {
    /// Spawn a worker process and connect a client to its stdio.
    ///
    /// When `exit_tx` is given, the client id is sent on it after an
    /// unexpected process exit (crash detection for the pool).
    pub fn spawn(
        id: impl Into<String>,
        config: &WorkerConfig,
        options: ClientOptions,
        exit_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self> {
        let id = id.into();

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {}", config.program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Spawn("stderr not captured".to_string()))?;
        let pid = child.id();

        let shared = Arc::new(Shared::new(id, exit_tx));
        tokio::spawn(read_loop(shared.clone(), stdout));
        tokio::spawn(stderr_loop(
            shared.clone(),
            stderr,
            options.stderr_tail_lines,
        ));

        // The monitor task owns the child: it reaps the process on natural
        // exit and force-kills it when escalation is requested.
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let monitor = shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(client = %monitor.id, ?status, "worker process exited");
                }
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    warn!(client = %monitor.id, "worker force killed");
                }
            }
        });

        info!(client = %shared.id, program = %config.program, "worker spawned");

        Ok(Self {
            shared,
            writer: Mutex::new(Box::new(stdin)),
            options,
            req_counter: AtomicU64::new(0),
            pid,
            kill_tx: Some(kill_tx),
        })
    }

    /// Connect a client over an arbitrary reader/writer pair.
    ///
    /// Used by tests to drive the protocol through an in-memory duplex
    /// instead of a real process.
    pub fn from_io<W, R>(
        id: impl Into<String>,
        writer: W,
        reader: R,
        options: ClientOptions,
        exit_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new(id.into(), exit_tx));
        tokio::spawn(read_loop(shared.clone(), reader));
        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            options,
            req_counter: AtomicU64::new(0),
            pid: None,
            kill_tx: None,
        }
    }

    /// Client (and worker) identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Retained stderr tail, oldest first.
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.shared.stderr_tail.lock().await.iter().cloned().collect()
    }

    fn next_request_id(&self) -> String {
        format!("req_{}", self.req_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a control command and wait for its response.
    pub async fn send(
        &self,
        op: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        if self.is_closed() {
            return Err(WorkerError::ClientClosed);
        }

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        let line = protocol::encode_command(&WorkerCommand::new(&id, op, params))?;
        if let Err(e) = self.write_line(&line).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::ClientClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(WorkerError::RequestTimeout(self.options.request_timeout))
            }
        }
    }

    /// Health check.
    pub async fn ping(&self) -> Result<serde_json::Value> {
        self.send("ping", None).await
    }

    /// Ask the worker to cancel the turn in flight.
    pub async fn abort(&self) -> Result<serde_json::Value> {
        self.send("abort", None).await
    }

    /// Start a streaming turn.
    ///
    /// At most one turn may be in flight per client; events arrive on the
    /// returned stream in worker order and end with a terminal event.
    pub async fn start_turn(&self, prompt: &str) -> Result<TurnStream> {
        if self.is_closed() {
            return Err(WorkerError::ClientClosed);
        }

        let (tx, rx) = mpsc::channel(TURN_EVENT_BUFFER);
        {
            let mut turn = self.shared.turn.lock().await;
            if turn.is_some() {
                return Err(WorkerError::Protocol(
                    "turn already in flight on this worker".to_string(),
                ));
            }
            *turn = Some(tx);
        }

        let command = WorkerCommand::new(
            self.next_request_id(),
            "run",
            Some(serde_json::json!({ "prompt": prompt })),
        );
        let line = match protocol::encode_command(&command) {
            Ok(line) => line,
            Err(e) => {
                self.shared.turn.lock().await.take();
                return Err(e);
            }
        };
        if let Err(e) = self.write_line(&line).await {
            self.shared.turn.lock().await.take();
            return Err(e);
        }

        Ok(TurnStream {
            rx,
            idle_timeout: self.options.turn_idle_timeout,
            shared: self.shared.clone(),
            done: false,
        })
    }

    /// Tear the client down.
    ///
    /// Fails all pending requests with `ClientClosed`, sends SIGTERM, and
    /// force-kills the process if it is still alive after the grace window.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.turn.lock().await.take();
        self.shared
            .fail_all_pending(|| WorkerError::ClientClosed)
            .await;

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if let Some(kill_tx) = &self.kill_tx {
            tokio::time::sleep(self.options.kill_grace).await;
            if !self.shared.exited.load(Ordering::SeqCst) {
                warn!(client = %self.shared.id, "worker ignored SIGTERM, escalating");
                let _ = kill_tx.send(()).await;
            }
        }

        debug!(client = %self.shared.id, "client closed");
    }
}

/// Ordered event stream for one turn.
pub struct TurnStream {
    rx: mpsc::Receiver<WorkerEvent>,
    idle_timeout: Duration,
    shared: Arc<Shared>,
    done: bool,
}

impl TurnStream {
    /// Next event in worker order.
    ///
    /// Returns `None` once a terminal event or a stream-ending error has
    /// been yielded. A quiet worker surfaces `RequestTimeout`; a dead one
    /// surfaces `WorkerCrashed`.
    pub async fn next(&mut self) -> Option<Result<WorkerEvent>> {
        if self.done {
            return None;
        }

        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(Ok(event))
            }
            Ok(None) => {
                self.done = true;
                if self.shared.closed.load(Ordering::SeqCst) {
                    Some(Err(WorkerError::ClientClosed))
                } else {
                    Some(Err(WorkerError::WorkerCrashed(
                        self.shared.stderr_summary().await,
                    )))
                }
            }
            Err(_) => {
                self.done = true;
                // stop routing late events from the stuck turn
                self.shared.turn.lock().await.take();
                Some(Err(WorkerError::RequestTimeout(self.idle_timeout)))
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut lines = LineBuffer::new();
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    match protocol::parse_line(&line) {
                        Ok(WorkerLine::Response(response)) => {
                            shared.resolve_response(response).await
                        }
                        Ok(WorkerLine::Event(event)) => shared.deliver_event(event).await,
                        Err(e) => warn!(client = %shared.id, "dropping malformed line: {}", e),
                    }
                }
            }
            Err(e) => {
                debug!(client = %shared.id, "stdout read failed: {}", e);
                break;
            }
        }
    }
    shared.on_stream_closed().await;
}

async fn stderr_loop<R>(shared: Arc<Shared>, reader: R, max_lines: usize)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(client = %shared.id, "worker stderr: {}", line);
        let mut tail = shared.stderr_tail.lock().await;
        if tail.len() >= max_lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
