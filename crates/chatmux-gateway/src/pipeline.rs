//! Message pipeline.
//!
//! Orchestrates one inbound message into a completed response: resolve the
//! session, claim its turn slot, acquire a worker, stream the worker's
//! events outward in arrival order, then clean up. Turn cleanup (clear
//! assignment, release worker, end turn) runs on every exit path.

use crate::error::GatewayError;
use crate::registry::SessionRegistry;
use crate::store::TranscriptEntry;
use crate::Result;
use async_trait::async_trait;
use chatmux_core::types::{
    ConversationKey, InboundMessage, OutboundEvent, OutboundPayload, SessionId, TurnStatus,
    WorkerEvent,
};
use chatmux_worker::{WorkerError, WorkerLease, WorkerPool};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Receives every outbound event, in emission order.
///
/// Channel plugins implement this to forward responses to their transport.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver one event.
    async fn deliver(&self, event: OutboundEvent);
}

/// How a completed turn ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    /// Session the turn ran in.
    pub session_id: SessionId,

    /// Final status.
    pub status: TurnStatus,
}

/// The inbound/outbound routing core.
pub struct MessagePipeline {
    pool: WorkerPool,
    registry: Arc<SessionRegistry>,
    sinks: RwLock<Vec<Arc<dyn OutboundSink>>>,
    events_tx: broadcast::Sender<OutboundEvent>,

    /// Leases for turns currently in flight, for abort routing.
    active: Mutex<HashMap<SessionId, WorkerLease>>,

    /// Sessions with an abort in progress. Checked when the turn settles.
    aborting: Mutex<HashSet<SessionId>>,

    acquire_timeout: Duration,
    abort_grace: Duration,
}

impl MessagePipeline {
    /// Create a pipeline over a pool and registry.
    pub fn new(pool: WorkerPool, registry: Arc<SessionRegistry>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            pool,
            registry,
            sinks: RwLock::new(Vec::new()),
            events_tx,
            active: Mutex::new(HashMap::new()),
            aborting: Mutex::new(HashSet::new()),
            acquire_timeout: Duration::from_secs(10),
            abort_grace: Duration::from_secs(2),
        }
    }

    /// Override how long an inbound message waits for a worker.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Override the abort grace window before the worker is torn down.
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    /// Register an outbound sink. Called once per channel plugin at startup.
    pub async fn register_sink(&self, sink: Arc<dyn OutboundSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Subscribe to the outbound event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events_tx.subscribe()
    }

    /// The session registry backing this pipeline.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one inbound message through a full turn.
    ///
    /// Overlapping turns for the same session are rejected with
    /// `SessionBusy` rather than queued. Errors that break the turn are
    /// also emitted as an outbound error event so subscribers see them.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<TurnSummary> {
        let key = ConversationKey::new(&message.channel, &message.conversation_id);
        let session = self.registry.resolve(&key).await?;
        let session_id = session.id;

        if let Err(e) = self.registry.begin_turn(&session_id).await {
            self.emit_error(&session_id, &e).await;
            return Err(e);
        }

        let lease = match self.pool.acquire(self.acquire_timeout).await {
            Ok(lease) => lease,
            Err(e) => {
                self.registry.end_turn(&session_id).await;
                let err = GatewayError::from(e);
                self.emit_error(&session_id, &err).await;
                return Err(err);
            }
        };
        debug!(session = %session_id, worker = %lease.worker_id, "turn started");
        self.registry
            .assign_worker(&session_id, &lease.worker_id)
            .await;
        self.active
            .lock()
            .await
            .insert(session_id.clone(), lease.clone());

        let (reply, outcome) = self.run_turn(&session_id, &lease, &message.text).await;

        // turn cleanup, unconditional
        let aborted = self.aborting.lock().await.remove(&session_id);
        if let Err(GatewayError::Worker(WorkerError::RequestTimeout(_))) = &outcome {
            // a stalled worker is not returned to service
            self.pool
                .mark_unhealthy(&lease.worker_id, "turn stalled")
                .await;
        }
        self.active.lock().await.remove(&session_id);
        self.registry.clear_worker(&session_id).await;
        self.pool.release(&lease.worker_id).await;
        self.registry.end_turn(&session_id).await;

        match outcome {
            Ok(()) => {
                let status = if aborted {
                    TurnStatus::Cancelled
                } else {
                    TurnStatus::Completed
                };
                self.finish_turn(&session_id, &message.text, reply, status)
                    .await
            }
            Err(e) if aborted => {
                debug!(session = %session_id, "turn cancelled: {}", e);
                self.finish_turn(&session_id, &message.text, reply, TurnStatus::Cancelled)
                    .await
            }
            Err(e) => {
                warn!(session = %session_id, "turn failed: {}", e);
                self.emit_error(&session_id, &e).await;
                Err(e)
            }
        }
    }

    /// Cancel the turn in flight for a session.
    ///
    /// The worker is asked to stop first; if it does not acknowledge within
    /// the grace window it is torn down and replaced. The turn settles with
    /// a `Cancelled` terminal event either way. No-op if nothing is in
    /// flight.
    pub async fn abort(&self, session_id: &SessionId) -> Result<()> {
        if self.registry.get(session_id).await.is_none() {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        let lease = { self.active.lock().await.get(session_id).cloned() };
        let Some(lease) = lease else {
            return Ok(());
        };

        info!(session = %session_id, worker = %lease.worker_id, "aborting turn");
        self.aborting.lock().await.insert(session_id.clone());

        match tokio::time::timeout(self.abort_grace, lease.client.abort()).await {
            Ok(Ok(_)) => {}
            _ => {
                warn!(worker = %lease.worker_id, "worker ignored abort, tearing it down");
                self.pool
                    .mark_unhealthy(&lease.worker_id, "unresponsive to abort")
                    .await;
                lease.client.close().await;
            }
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        session_id: &SessionId,
        lease: &WorkerLease,
        text: &str,
    ) -> (String, Result<()>) {
        let mut reply = String::new();
        let mut stream = match lease.client.start_turn(text).await {
            Ok(stream) => stream,
            Err(e) => return (reply, Err(e.into())),
        };

        loop {
            match stream.next().await {
                Some(Ok(WorkerEvent::MessageStart)) => {}
                Some(Ok(WorkerEvent::TextDelta { text })) => {
                    reply.push_str(&text);
                    self.emit(OutboundEvent::new(
                        session_id.clone(),
                        OutboundPayload::Text { text },
                    ))
                    .await;
                }
                Some(Ok(WorkerEvent::ToolCall { tool, .. })) => {
                    self.emit(OutboundEvent::new(
                        session_id.clone(),
                        OutboundPayload::ToolCall { tool },
                    ))
                    .await;
                }
                Some(Ok(WorkerEvent::MessageEnd)) => return (reply, Ok(())),
                Some(Ok(WorkerEvent::Error { message })) => {
                    return (reply, Err(GatewayError::Worker(WorkerError::Rpc(message))));
                }
                Some(Err(e)) => return (reply, Err(e.into())),
                None => {
                    return (
                        reply,
                        Err(GatewayError::Internal(
                            "turn stream ended without a terminal event".to_string(),
                        )),
                    )
                }
            }
        }
    }

    async fn finish_turn(
        &self,
        session_id: &SessionId,
        prompt: &str,
        reply: String,
        status: TurnStatus,
    ) -> Result<TurnSummary> {
        self.registry
            .append_transcript(session_id, TranscriptEntry::new(prompt, reply, status))
            .await?;
        self.emit(OutboundEvent::new(
            session_id.clone(),
            OutboundPayload::Done { status },
        ))
        .await;
        debug!(session = %session_id, ?status, "turn finished");
        Ok(TurnSummary {
            session_id: session_id.clone(),
            status,
        })
    }

    async fn emit(&self, event: OutboundEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event.clone());
        let sinks: Vec<_> = self.sinks.read().await.clone();
        for sink in sinks {
            sink.deliver(event.clone()).await;
        }
    }

    async fn emit_error(&self, session_id: &SessionId, error: &GatewayError) {
        self.emit(OutboundEvent::new(
            session_id.clone(),
            OutboundPayload::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
                retryable: error.is_retryable(),
            },
        ))
        .await;
    }
}
