//! Endpoint: one agent's mailbox, capability table and message loop.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{Bus, ReplyFuture};
use crate::capability::{
    Capability, CapabilityTable, FnCapability, FnNotificationHandler, NotificationHandler,
    TypedCapability,
};
use crate::error::{Error, Result};
use crate::protocol::{AgentKind, Envelope, ErrorObject, MessageKind, Params};
use crate::router::MailboxReceiver;

type Listeners = HashMap<String, Vec<Arc<dyn NotificationHandler>>>;

struct EndpointInner {
    kind: AgentKind,
    bus: Bus,
    capabilities: RwLock<CapabilityTable>,
    listeners: RwLock<Listeners>,
    /// Taken by `run`.
    mailbox: Mutex<Option<MailboxReceiver>>,
}

/// In-process representative of one agent. Cheap to clone; clones share the
/// same mailbox and tables.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

/// Non-owning handle to an [`Endpoint`], for capabilities that need to call
/// back into their own endpoint.
#[derive(Clone)]
pub struct WeakEndpoint {
    inner: Weak<EndpointInner>,
}

impl WeakEndpoint {
    /// Upgrade to a full handle if the endpoint is still alive.
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.inner.upgrade().map(|inner| Endpoint { inner })
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Endpoint {
    /// Attach a new endpoint for `kind` to the bus.
    pub fn attach(bus: &Bus, kind: AgentKind) -> Result<Self> {
        let mailbox = bus.attach(kind)?;
        Ok(Self {
            inner: Arc::new(EndpointInner {
                kind,
                bus: bus.clone(),
                capabilities: RwLock::new(CapabilityTable::new()),
                listeners: RwLock::new(HashMap::new()),
                mailbox: Mutex::new(Some(mailbox)),
            }),
        })
    }

    /// Agent identity.
    pub fn kind(&self) -> AgentKind {
        self.inner.kind
    }

    /// Bus this endpoint is attached to.
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Register a capability. Last write wins.
    pub fn register(
        &self,
        method: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Result<()> {
        let method = method.into();
        let previous = write(&self.inner.capabilities).register(method.clone(), capability)?;
        if previous.is_some() {
            debug!(agent = %self.inner.kind, %method, "capability replaced");
        }
        Ok(())
    }

    /// Register an async closure over raw parameters.
    pub fn register_fn<F, Fut>(&self, method: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(method, Arc::new(FnCapability::new(f)))
    }

    /// Register an async closure with typed arguments and result.
    pub fn register_typed<P, R, F, Fut>(&self, method: impl Into<String>, f: F) -> Result<()>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register(method, Arc::new(TypedCapability::new(f)))
    }

    /// Remove a capability.
    pub fn unregister(&self, method: &str) -> bool {
        write(&self.inner.capabilities).remove(method).is_some()
    }

    /// Registered capability names.
    pub fn methods(&self) -> Vec<String> {
        read(&self.inner.capabilities).methods()
    }

    fn capability(&self, method: &str) -> Option<Arc<dyn Capability>> {
        read(&self.inner.capabilities).get(method)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Add a local handler for a notification method and subscribe this
    /// agent to it on the bus.
    pub fn subscribe(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(Error::InvalidParams("method name must not be empty".into()));
        }

        write(&self.inner.listeners)
            .entry(method.clone())
            .or_default()
            .push(handler);
        self.inner.bus.subscribe(method, self.inner.kind);
        Ok(())
    }

    /// Subscribe with an async closure.
    pub fn subscribe_fn<F, Fut>(&self, method: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(method, Arc::new(FnNotificationHandler::new(f)))
    }

    /// Drop the local handlers of a method and unsubscribe from it.
    pub fn unsubscribe(&self, method: &str) -> bool {
        let had_handlers = write(&self.inner.listeners).remove(method).is_some();
        let was_subscribed = self.inner.bus.unsubscribe(method, self.inner.kind);
        had_handlers || was_subscribed
    }

    fn listeners(&self, method: &str) -> Vec<Arc<dyn NotificationHandler>> {
        read(&self.inner.listeners)
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a request and return the handle on its reply without waiting.
    pub async fn call(
        &self,
        target: AgentKind,
        method: impl Into<String>,
        params: Params,
        timeout: Duration,
    ) -> Result<ReplyFuture> {
        let request = Envelope::request(self.inner.kind, target, method, params);
        self.inner.bus.call(request, timeout).await
    }

    /// Send a request and wait for its result.
    pub async fn send_request(
        &self,
        target: AgentKind,
        method: impl Into<String>,
        params: Params,
        timeout: Duration,
    ) -> Result<Value> {
        self.call(target, method, params, timeout).await?.await
    }

    /// Broadcast a notification to the method's subscribers. Does not wait
    /// for subscribers to handle it.
    pub async fn publish(&self, method: impl Into<String>, params: Params) -> Result<()> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(Error::InvalidParams("method name must not be empty".into()));
        }
        let notification = Envelope::notification(self.inner.kind, method, params);
        self.inner.bus.route(notification).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle one request with the local capability table and build its
    /// reply. Handler failures and panics become error envelopes.
    pub async fn handle(&self, request: &Envelope) -> Result<Envelope> {
        if request.kind() != MessageKind::Request {
            return Err(Error::InvalidState(format!(
                "cannot handle a {} envelope",
                request.kind()
            )));
        }

        let outcome = match self.capability(request.method()) {
            Some(capability) => AssertUnwindSafe(capability.invoke(request.params().clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(Error::HandlerFailure(panic_message(panic.as_ref())))),
            None => Err(Error::MethodNotFound(request.method().to_string())),
        };

        match outcome {
            Ok(result) => request.reply(result),
            Err(err) => {
                warn!(
                    agent = %self.inner.kind,
                    method = %request.method(),
                    caller = %request.source(),
                    %err,
                    "request failed"
                );
                request.reply_error(handler_error(err))
            }
        }
    }

    /// Run the message loop until the endpoint is detached.
    ///
    /// Requests and notification handlers run concurrently inside this one
    /// task, so a handler that is itself waiting on a call never stops the
    /// mailbox from being drained. After the mailbox closes, the loop
    /// finishes whatever is in flight and returns.
    pub async fn run(&self) -> Result<()> {
        let mut mailbox = self
            .inner
            .mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                Error::InvalidState(format!("{} endpoint is already running", self.inner.kind))
            })?;

        info!(agent = %self.inner.kind, "endpoint loop started");
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Option<Envelope>>> =
            FuturesUnordered::new();
        let mut open = true;

        loop {
            tokio::select! {
                next = mailbox.recv(), if open => match next {
                    Some(envelope) => match envelope.kind() {
                        MessageKind::Request => in_flight.push(self.serve(envelope).boxed()),
                        MessageKind::Notification => in_flight.extend(self.notify(envelope)),
                        MessageKind::Response | MessageKind::Error => {
                            self.inner.bus.route(envelope).await
                        }
                    },
                    None => open = false,
                },
                Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(reply) = reply {
                        self.inner.bus.route(reply).await;
                    }
                }
                else => break,
            }
        }

        info!(agent = %self.inner.kind, "endpoint loop stopped");
        Ok(())
    }

    async fn serve(&self, request: Envelope) -> Option<Envelope> {
        debug!(
            agent = %self.inner.kind,
            id = %request.id(),
            method = %request.method(),
            "serving request"
        );
        match self.handle(&request).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(agent = %self.inner.kind, %e, "no reply built");
                None
            }
        }
    }

    fn notify(&self, notification: Envelope) -> Vec<BoxFuture<'_, Option<Envelope>>> {
        let agent = self.inner.kind;
        let listeners = self.listeners(notification.method());
        if listeners.is_empty() {
            debug!(%agent, method = %notification.method(), "notification without local handler");
        }

        listeners
            .into_iter()
            .map(|handler| {
                let method = notification.method().to_string();
                let params = notification.params().clone();
                async move {
                    let outcome = AssertUnwindSafe(handler.notify(params))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(Error::HandlerFailure(panic_message(panic.as_ref())))
                        });
                    if let Err(e) = outcome {
                        warn!(%agent, %method, %e, "notification handler failed");
                    }
                    None
                }
                .boxed()
            })
            .collect()
    }

    /// Detach from the bus. The loop drains what is already queued, finishes
    /// in-flight handlers and returns. Calls this endpoint is still waiting
    /// on resolve to [`Error::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.bus.detach(self.inner.kind);
    }
}

/// Errors raised by handlers keep their code only when it describes the
/// request itself; anything else is reported as a handler failure.
fn handler_error(err: Error) -> ErrorObject {
    match err {
        Error::InvalidParams(_)
        | Error::MethodNotFound(_)
        | Error::HandlerFailure(_)
        | Error::Remote { .. } => err.to_error_object(),
        other => Error::HandlerFailure(other.to_string()).to_error_object(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::error_codes;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    const SECOND: Duration = Duration::from_secs(1);

    fn spawn(endpoint: &Endpoint) -> JoinHandle<Result<()>> {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.run().await })
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[derive(Deserialize)]
    struct SleepArgs {
        ms: u64,
    }

    fn vision(bus: &Bus) -> Endpoint {
        let vision = Endpoint::attach(bus, AgentKind::Vision).unwrap();
        vision
            .register_fn("ping", |_| async { Ok(json!({"pong": true})) })
            .unwrap();
        vision
            .register_typed("sleep", |args: SleepArgs| async move {
                tokio::time::sleep(Duration::from_millis(args.ms)).await;
                Ok(args.ms)
            })
            .unwrap();
        vision
            .register_fn("fail", |_| async {
                Err(Error::HandlerFailure("model not loaded".into()))
            })
            .unwrap();
        vision
            .register_fn("explode", |params: Params| async move {
                assert_eq!(params.len(), 3, "tensor shape mismatch");
                Ok(Value::Null)
            })
            .unwrap();
        spawn(&vision);
        vision
    }

    #[tokio::test]
    async fn test_ping_scenario() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let result = orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_target_fails_immediately() {
        let bus = Bus::default();
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        let started = Instant::now();

        let err = orchestrator
            .send_request(AgentKind::Generation, "x", Params::new(), SECOND)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnroutableTarget(AgentKind::Generation)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let err = orchestrator
            .send_request(AgentKind::Vision, "transcribe", Params::new(), SECOND)
            .await
            .unwrap_err();
        match err {
            Error::Remote { code, message } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found: transcribe");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_and_panic_keep_loop_alive() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let err = orchestrator
            .send_request(AgentKind::Vision, "fail", Params::new(), SECOND)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                code: error_codes::HANDLER_FAILURE,
                ref message,
            } if message == "model not loaded"
        ));

        let err = orchestrator
            .send_request(AgentKind::Vision, "explode", Params::new(), SECOND)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                code: error_codes::HANDLER_FAILURE,
                ref message,
            } if message.contains("tensor shape mismatch")
        ));

        let result = orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_invalid_typed_params() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let err = orchestrator
            .send_request(
                AgentKind::Vision,
                "sleep",
                params(json!({"ms": "soon"})),
                SECOND,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                code: error_codes::INVALID_PARAMS,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out_without_disturbing_others() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let slow = orchestrator
            .call(AgentKind::Vision, "sleep", params(json!({"ms": 5_000})), SECOND)
            .await
            .unwrap();
        let steady = orchestrator
            .call(AgentKind::Vision, "sleep", params(json!({"ms": 3_000})), 10 * SECOND)
            .await
            .unwrap();

        assert!(matches!(slow.await, Err(Error::Timeout(_))));
        assert_eq!(steady.await.unwrap(), json!(3_000));

        // Let the slow handler finish; its reply has nowhere to go.
        tokio::time::sleep(5 * SECOND).await;
        let stats = bus.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.late_replies_dropped, 1);
        assert_eq!(stats.pending_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_serves_while_handler_waits() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        let started = Instant::now();

        let slow = orchestrator
            .call(AgentKind::Vision, "sleep", params(json!({"ms": 1_000})), 10 * SECOND)
            .await
            .unwrap();
        let pong = orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), 10 * SECOND)
            .await
            .unwrap();

        assert_eq!(pong, json!({"pong": true}));
        assert!(started.elapsed() < SECOND);
        assert_eq!(slow.await.unwrap(), json!(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reordered_completions_resolve_independently() {
        let bus = Bus::default();
        let _vision = vision(&bus);
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        let (long, short) = tokio::join!(
            orchestrator.send_request(
                AgentKind::Vision,
                "sleep",
                params(json!({"ms": 50})),
                SECOND
            ),
            orchestrator.send_request(
                AgentKind::Vision,
                "sleep",
                params(json!({"ms": 10})),
                SECOND
            ),
        );

        assert_eq!(long.unwrap(), json!(50));
        assert_eq!(short.unwrap(), json!(10));
        assert_eq!(bus.target_stats(AgentKind::Vision).unwrap().successful_calls, 2);
    }

    #[tokio::test]
    async fn test_nested_call_from_handler() {
        let bus = Bus::default();
        let _vision = vision(&bus);

        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        let handle = orchestrator.downgrade();
        orchestrator
            .register_fn("relay", move |params| {
                let handle = handle.clone();
                async move {
                    let endpoint = handle
                        .upgrade()
                        .ok_or_else(|| Error::InvalidState("orchestrator gone".into()))?;
                    endpoint
                        .send_request(AgentKind::Vision, "ping", params, SECOND)
                        .await
                }
            })
            .unwrap();
        spawn(&orchestrator);

        let transcription = Endpoint::attach(&bus, AgentKind::Transcription).unwrap();
        let result = transcription
            .send_request(AgentKind::Orchestrator, "relay", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    fn recorder(
        endpoint: &Endpoint,
        method: &str,
        seen: mpsc::UnboundedSender<AgentKind>,
    ) {
        let kind = endpoint.kind();
        endpoint
            .subscribe_fn(method, move |_| {
                let seen = seen.clone();
                async move {
                    seen.send(kind).ok();
                    Ok(())
                }
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_reaches_exactly_the_subscribers() {
        let bus = Bus::default();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();

        let vision = Endpoint::attach(&bus, AgentKind::Vision).unwrap();
        let generation = Endpoint::attach(&bus, AgentKind::Generation).unwrap();
        let transcription = Endpoint::attach(&bus, AgentKind::Transcription).unwrap();
        recorder(&vision, "status", seen_tx.clone());
        recorder(&generation, "status", seen_tx.clone());
        recorder(&transcription, "frame", seen_tx);
        for endpoint in [&vision, &generation, &transcription] {
            spawn(endpoint);
        }

        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        orchestrator
            .publish("status", params(json!({"state": "ready"})))
            .await
            .unwrap();

        let mut got = vec![seen.recv().await.unwrap(), seen.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![AgentKind::Vision, AgentKind::Generation]);

        tokio::time::sleep(SECOND).await;
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_endpoint_not_invoked() {
        let bus = Bus::default();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();

        let vision = Endpoint::attach(&bus, AgentKind::Vision).unwrap();
        recorder(&vision, "status", seen_tx);
        spawn(&vision);
        assert!(vision.unsubscribe("status"));

        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        orchestrator.publish("status", Params::new()).await.unwrap();

        tokio::time::sleep(SECOND).await;
        assert!(seen.try_recv().is_err());
        assert_eq!(bus.stats().notifications_delivered, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = Bus::default();
        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();

        orchestrator
            .publish("status", params(json!({"state": "ready"})))
            .await
            .unwrap();
        assert_eq!(bus.stats(), crate::bus::BusStats::default());
    }

    #[tokio::test]
    async fn test_failing_listener_is_isolated() {
        let bus = Bus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done) = mpsc::unbounded_channel();

        let vision = vision(&bus);
        vision
            .subscribe_fn("status", |_| async {
                Err(Error::HandlerFailure("listener broke".into()))
            })
            .unwrap();
        let counter = calls.clone();
        vision
            .subscribe_fn("status", move |_| {
                let counter = counter.clone();
                let done_tx = done_tx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    done_tx.send(()).ok();
                    Ok(())
                }
            })
            .unwrap();

        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        orchestrator.publish("status", Params::new()).await.unwrap();
        done.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let pong = orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(pong, json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop_and_cancels_calls() {
        let bus = Bus::default();
        let vision = Endpoint::attach(&bus, AgentKind::Vision).unwrap();
        let running = spawn(&vision);

        let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator).unwrap();
        orchestrator
            .subscribe_fn("status", |_| async { Ok(()) })
            .unwrap();

        // Attached but never run, so this call stays outstanding.
        let _generation = Endpoint::attach(&bus, AgentKind::Generation).unwrap();
        let waiting = orchestrator
            .call(AgentKind::Generation, "x", Params::new(), 10 * SECOND)
            .await
            .unwrap();

        orchestrator.shutdown();
        assert!(matches!(waiting.await, Err(Error::Cancelled)));
        assert!(bus.subscribers("status").is_empty());
        assert!(!bus.has_route(AgentKind::Orchestrator));

        vision.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let bus = Bus::default();
        let vision = Endpoint::attach(&bus, AgentKind::Vision).unwrap();
        let _running = spawn(&vision);
        tokio::task::yield_now().await;

        assert!(matches!(vision.run().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_handle_builds_reply() {
        let bus = Bus::default();
        let vision = Endpoint::attach(&bus, AgentKind::Vision).unwrap();
        vision
            .register_fn("ping", |_| async { Ok(json!("pong")) })
            .unwrap();

        let request = Envelope::request(
            AgentKind::Orchestrator,
            AgentKind::Vision,
            "ping",
            Params::new(),
        );
        let reply = vision.handle(&request).await.unwrap();
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.id(), request.id());
        assert_eq!(reply.result(), Some(&json!("pong")));

        let missing = Envelope::request(
            AgentKind::Orchestrator,
            AgentKind::Vision,
            "nope",
            Params::new(),
        );
        let reply = vision.handle(&missing).await.unwrap();
        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.error().unwrap().code, error_codes::METHOD_NOT_FOUND);
    }
}
