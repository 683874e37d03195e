//! RpcGateway - delegated execution on the authority peer
//!
//! Caller side: `call` routes a request to the current authority, collapses
//! identical in-flight calls into one request, and fails with a typed error
//! on timeout or when no authority is online.
//!
//! Authority side: a listener task decodes requests addressed to this peer,
//! checks the claimed caller against the transport sender, and dispatches
//! to the registered handler.

use super::protocol::{dedupe_key, idempotency_key, ErrorCode, RpcRequest, RpcResponse, RpcResult};
use super::registry::{HandlerRegistry, IdempotencyLedger, RpcContext};
use crate::config::EngineConfig;
use crate::election::{elect_authority, with_local};
use crate::error::EngineError;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use huddle_model::{publish_json, Delivery, Peer, PeerId, PresenceProvider, PubSub};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-call options.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallOptions {
    /// Overrides the session's `rpc_timeout`.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

type SharedCall = Shared<BoxFuture<'static, Result<Value, EngineError>>>;

struct PendingCall {
    call_id: u64,
    created_at: Instant,
    future: SharedCall,
}

struct Waiter {
    authority: PeerId,
    tx: oneshot::Sender<RpcResult>,
}

struct GatewayState {
    next_call_id: u64,
    pending: HashMap<String, PendingCall>,
    waiters: HashMap<Uuid, Waiter>,
    ledger: IdempotencyLedger,
}

struct GatewayInner {
    local: Peer,
    pubsub: Arc<dyn PubSub>,
    presence: Arc<dyn PresenceProvider>,
    registry: Arc<HandlerRegistry>,
    request_topic: String,
    response_topic: String,
    default_timeout: Duration,
    state: Mutex<GatewayState>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share one gateway.
#[derive(Clone)]
pub struct RpcGateway {
    inner: Arc<GatewayInner>,
}

impl RpcGateway {
    /// Subscribe to the RPC topics and spawn the listener tasks.
    ///
    /// Only authority candidates serve requests; every peer listens for
    /// responses.
    #[tracing::instrument(skip_all, fields(peer = %local.id))]
    pub async fn start(
        local: Peer,
        pubsub: Arc<dyn PubSub>,
        presence: Arc<dyn PresenceProvider>,
        registry: Arc<HandlerRegistry>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let inner = Arc::new(GatewayInner {
            request_topic: config.topic("rpc.request"),
            response_topic: config.topic("rpc.response"),
            default_timeout: config.rpc_timeout,
            state: Mutex::new(GatewayState {
                next_call_id: 0,
                pending: HashMap::new(),
                waiters: HashMap::new(),
                ledger: IdempotencyLedger::new(config.idempotency_capacity),
            }),
            shutdown: CancellationToken::new(),
            local,
            pubsub,
            presence,
            registry,
        });

        let responses = inner.pubsub.subscribe(&inner.response_topic).await?;
        tokio::spawn(inner.clone().run_responses(responses));

        if inner.local.is_authority_candidate {
            let requests = inner.pubsub.subscribe(&inner.request_topic).await?;
            tokio::spawn(inner.clone().run_requests(requests));
        }

        tracing::debug!(authority_candidate = inner.local.is_authority_candidate, "RPC gateway started");
        Ok(Self { inner })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Current routing target, if any authority is online.
    pub fn authority(&self) -> Option<PeerId> {
        elect_authority(&self.inner.peers())
    }

    /// Ask the authority to run `operation` on our behalf.
    ///
    /// An identical call (same operation and payload) already in flight is
    /// joined instead of re-sent; both callers get the same result.
    #[tracing::instrument(skip(self, payload, options), fields(peer = %self.inner.local.id))]
    pub async fn call(&self, operation: &str, payload: Value, options: CallOptions) -> Result<Value, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let key = dedupe_key(operation, &payload)?;
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);

        let future = {
            let mut state = self.inner.state();
            if let Some(pending) = state.pending.get(&key) {
                tracing::debug!(
                    operation,
                    age_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Joining in-flight call"
                );
                pending.future.clone()
            } else {
                state.next_call_id += 1;
                let call_id = state.next_call_id;

                // The request runs on its own task so the dedupe slot is
                // released even if every waiter is dropped.
                let inner = self.inner.clone();
                let task_key = key.clone();
                let operation = operation.to_string();
                let handle = tokio::spawn(async move {
                    let result = inner.issue(operation, payload, timeout).await;
                    inner.release(&task_key, call_id);
                    result
                });
                let future = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(EngineError::Internal(format!("rpc task failed: {}", e))),
                    }
                }
                .boxed()
                .shared();

                state.pending.insert(
                    key,
                    PendingCall { call_id, created_at: Instant::now(), future: future.clone() },
                );
                future
            }
        };
        future.await
    }

    /// Number of distinct calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Stop the listeners and fail every waiter with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state();
        // Dropping the senders wakes the waiters
        state.waiters.clear();
        state.pending.clear();
    }
}

impl GatewayInner {
    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers(&self) -> Vec<Peer> {
        with_local(self.presence.active_peers(), &self.local)
    }

    /// Drop the dedupe entry, unless a newer call already replaced it.
    fn release(&self, key: &str, call_id: u64) {
        let mut state = self.state();
        if state.pending.get(key).map(|p| p.call_id) == Some(call_id) {
            state.pending.remove(key);
        }
    }

    async fn issue(&self, operation: String, payload: Value, timeout: Duration) -> Result<Value, EngineError> {
        let peers = self.peers();
        let authority = elect_authority(&peers).ok_or(EngineError::NoAuthorityAvailable)?;

        if authority == self.local.id {
            tracing::debug!(operation = %operation, "Local peer is the authority, serving in place");
            return self.serve(self.local.id.clone(), &operation, payload).await.into_result();
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.state().waiters.insert(request_id, Waiter { authority: authority.clone(), tx });

        let request = RpcRequest {
            request_id,
            operation,
            payload,
            caller: self.local.id.clone(),
            target: authority.clone(),
        };
        if let Err(e) = publish_json(self.pubsub.as_ref(), &self.request_topic, &request).await {
            self.state().waiters.remove(&request_id);
            return Err(e.into());
        }
        tracing::debug!(request_id = %request_id, authority = %authority, operation = %request.operation, "RPC request sent");

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.state().waiters.remove(&request_id);
        match outcome {
            Ok(Ok(result)) => result.into_result(),
            Ok(Err(_)) => Err(EngineError::Shutdown),
            Err(_) => {
                tracing::warn!(request_id = %request_id, operation = %request.operation, ?timeout, "RPC timed out");
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Run a handler for `caller`. `caller` must already be authenticated.
    async fn serve(&self, caller: PeerId, operation: &str, payload: Value) -> RpcResult {
        if !self.local.is_authority_candidate {
            return RpcResult::failure(ErrorCode::NotAuthority, format!("{} is not an authority", self.local.id));
        }

        let key = idempotency_key(&payload).map(str::to_string);
        let recorded = key
            .as_deref()
            .and_then(|key| self.state().ledger.get(&caller, operation, key).cloned());
        if let Some(data) = recorded {
            tracing::debug!(caller = %caller, operation, "Replaying recorded result");
            return RpcResult::ok(data);
        }

        let Some(handler) = self.registry.get(operation) else {
            return RpcResult::from_handler(Err(EngineError::UnknownOperation(operation.to_string())));
        };

        let ctx = RpcContext { caller: caller.clone(), peers: self.peers() };
        let result = match AssertUnwindSafe(handler.handle(ctx, payload)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(caller = %caller, operation, "RPC handler panicked");
                Err(EngineError::Internal(format!("handler for {} panicked", operation)))
            }
        };

        if let (Some(key), Ok(data)) = (key, &result) {
            self.state().ledger.record(caller, operation.to_string(), key, data.clone());
        }
        RpcResult::from_handler(result)
    }

    async fn handle_request(&self, delivery: Delivery) {
        let request: RpcRequest = match serde_json::from_value(delivery.message) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(from = %delivery.from, error = %e, "Malformed RPC request");
                return;
            }
        };
        if request.target != self.local.id {
            return;
        }

        let result = if request.caller != delivery.from {
            tracing::warn!(from = %delivery.from, claimed = %request.caller, "RPC caller does not match sender");
            RpcResult::failure(ErrorCode::PermissionDenied, "caller does not match sender")
        } else {
            self.serve(delivery.from.clone(), &request.operation, request.payload).await
        };

        let response = RpcResponse { request_id: request.request_id, target: delivery.from, result };
        if let Err(e) = publish_json(self.pubsub.as_ref(), &self.response_topic, &response).await {
            tracing::error!(request_id = %response.request_id, error = %e, "Failed to publish RPC response");
        }
    }

    fn handle_response(&self, delivery: Delivery) {
        let response: RpcResponse = match serde_json::from_value(delivery.message) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(from = %delivery.from, error = %e, "Malformed RPC response");
                return;
            }
        };
        if response.target != self.local.id {
            return;
        }

        let mut state = self.state();
        let expected = state.waiters.get(&response.request_id).map(|w| w.authority.clone());
        match expected {
            Some(authority) if authority == delivery.from => {
                if let Some(waiter) = state.waiters.remove(&response.request_id) {
                    let _ = waiter.tx.send(response.result);
                }
            }
            Some(authority) => {
                tracing::warn!(
                    request_id = %response.request_id,
                    from = %delivery.from,
                    expected = %authority,
                    "Ignoring RPC response from unexpected peer"
                );
            }
            None => {
                tracing::debug!(request_id = %response.request_id, "Response for unknown or expired request");
            }
        }
    }

    async fn run_requests(self: Arc<Self>, mut requests: broadcast::Receiver<Delivery>) {
        // Requests are served one at a time so ledger lookups never race
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = requests.recv() => match next {
                    Ok(delivery) => self.handle_request(delivery).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "RPC request listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        tracing::debug!(peer = %self.local.id, "RPC request listener stopped");
    }

    async fn run_responses(self: Arc<Self>, mut responses: broadcast::Receiver<Delivery>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = responses.recv() => match next {
                    Ok(delivery) => self.handle_response(delivery),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "RPC response listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        tracing::debug!(peer = %self.local.id, "RPC response listener stopped");
    }
}
