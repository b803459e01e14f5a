//! Routing and correlation bus connecting endpoints.
//!
//! The bus owns the three pieces of shared state in the protocol: the routing
//! table, the pending-call table and the subscription registry. Each sits
//! behind its own mutex and no guard is ever held across an `.await`.
//!
//! Requests are registered as pending before they are routed, and every
//! pending call gets a timer task that evicts it at its deadline. Whoever
//! removes an entry from the pending table (reply, timer or cancellation)
//! owns its resolution, which makes every outcome at-most-once.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pending::{CallKey, CallOutcome, PendingCall, PendingCallTable};
use crate::protocol::{AgentKind, Envelope, MessageKind};
use crate::router::{
    mailbox, Backpressure, Location, MailboxReceiver, PeerAddress, Route, RoutingTable,
    TargetStats, Undelivered,
};
use crate::subscriptions::SubscriptionRegistry;

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of each agent mailbox; `None` means unbounded.
    pub mailbox_capacity: Option<usize>,
    /// Policy applied when a bounded mailbox is full.
    pub backpressure: Backpressure,
    /// Network address of every agent kind.
    pub peers: BTreeMap<AgentKind, PeerAddress>,
    /// Timeout for establishing transport links, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl BusConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Address of an agent kind, if known.
    pub fn peer(&self, kind: AgentKind) -> Option<&PeerAddress> {
        self.peers.get(&kind)
    }

    /// Link establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        let peers = [
            (AgentKind::Orchestrator, 50050),
            (AgentKind::Transcription, 50051),
            (AgentKind::Vision, 50052),
            (AgentKind::Generation, 50053),
        ]
        .into_iter()
        .map(|(kind, port)| (kind, PeerAddress::new("127.0.0.1", port)))
        .collect();

        Self {
            mailbox_capacity: None,
            backpressure: Backpressure::Block,
            peers,
            connect_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Default)]
struct BusMetrics {
    routed: AtomicU64,
    notifications_delivered: AtomicU64,
    unroutable: AtomicU64,
    late_replies_dropped: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Requests enqueued and replies resolved.
    pub routed: u64,
    /// Notification copies enqueued.
    pub notifications_delivered: u64,
    /// Requests bounced because the target had no live route.
    pub unroutable: u64,
    /// Replies that matched no pending call.
    pub late_replies_dropped: u64,
    /// Calls evicted at their deadline.
    pub timeouts: u64,
    /// Calls withdrawn by their caller or by shutdown.
    pub cancellations: u64,
    /// Deliveries refused by a full mailbox.
    pub rejected: u64,
    /// Calls currently outstanding.
    pub pending_calls: usize,
}

struct BusInner {
    config: BusConfig,
    routes: Mutex<RoutingTable>,
    pending: Mutex<PendingCallTable>,
    subscriptions: Mutex<SubscriptionRegistry>,
    metrics: BusMetrics,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Central router and correlation authority. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                routes: Mutex::new(RoutingTable::new()),
                pending: Mutex::new(PendingCallTable::new()),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                metrics: BusMetrics::default(),
            }),
        }
    }

    /// Bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------

    /// Create the mailbox of a local endpoint and route `kind` to it.
    pub(crate) fn attach(&self, kind: AgentKind) -> Result<MailboxReceiver> {
        let mut routes = lock(&self.inner.routes);
        if let Some(route) = routes.get(kind) {
            if route.is_local() && !route.mailbox.is_closed() {
                return Err(Error::AlreadyAttached(kind));
            }
        }

        let (tx, rx) = mailbox(self.inner.config.mailbox_capacity);
        if let Some(Route {
            location: Location::Remote(peer),
            ..
        }) = routes.set(kind, Route::local(tx))
        {
            info!(agent = %kind, %peer, "local endpoint replaces remote route");
        }

        info!(agent = %kind, "endpoint attached");
        Ok(rx)
    }

    /// Remove a local endpoint: its route, its subscriptions and the calls it
    /// is still waiting on.
    pub fn detach(&self, kind: AgentKind) {
        let removed = {
            let mut routes = lock(&self.inner.routes);
            match routes.get(kind) {
                Some(route) if route.is_local() => routes.remove(kind),
                _ => None,
            }
        };
        let unsubscribed = lock(&self.inner.subscriptions).unsubscribe_all(kind);
        let orphaned = lock(&self.inner.pending).drain_source(kind);

        let cancelled = orphaned.len();
        for call in orphaned {
            bump(&self.inner.metrics.cancellations);
            call.resolve(Err(Error::Cancelled));
        }

        info!(
            agent = %kind,
            route_removed = removed.is_some(),
            unsubscribed,
            cancelled,
            "endpoint detached"
        );
    }

    /// Install or replace the route of an agent. Pending calls toward the
    /// agent are left untouched.
    pub(crate) fn set_route(&self, kind: AgentKind, route: Route) -> Option<Route> {
        debug!(agent = %kind, location = ?route.location, "route updated");
        lock(&self.inner.routes).set(kind, route)
    }

    /// Remove the route of an agent.
    pub(crate) fn remove_route(&self, kind: AgentKind) -> Option<Route> {
        lock(&self.inner.routes).remove(kind)
    }

    /// Agents with a live route.
    pub fn agents(&self) -> Vec<(AgentKind, Location)> {
        lock(&self.inner.routes).agents()
    }

    /// Whether `kind` currently has a route.
    pub fn has_route(&self, kind: AgentKind) -> bool {
        lock(&self.inner.routes).get(kind).is_some()
    }

    /// Routed agents with a healthy call record.
    pub fn available_agents(&self) -> Vec<AgentKind> {
        lock(&self.inner.routes).available_agents()
    }

    /// Call statistics toward one agent.
    pub fn target_stats(&self, kind: AgentKind) -> Option<TargetStats> {
        lock(&self.inner.routes).stats(kind)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe an agent to a notification method.
    pub fn subscribe(&self, method: impl Into<String>, agent: AgentKind) -> bool {
        lock(&self.inner.subscriptions).subscribe(method, agent)
    }

    /// Unsubscribe an agent from a notification method.
    pub fn unsubscribe(&self, method: &str, agent: AgentKind) -> bool {
        lock(&self.inner.subscriptions).unsubscribe(method, agent)
    }

    /// Current subscribers of a method.
    pub fn subscribers(&self, method: &str) -> Vec<AgentKind> {
        lock(&self.inner.subscriptions).subscribers(method)
    }

    // ------------------------------------------------------------------
    // Pending calls
    // ------------------------------------------------------------------

    /// Register an outstanding request. The bus resolves it with
    /// [`Error::Timeout`] once `deadline` passes without a reply.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_pending(
        &self,
        id: &str,
        source: AgentKind,
        target: AgentKind,
        method: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<CallOutcome>> {
        let key = CallKey::new(source, id);
        let (call, rx) = PendingCall::new(key.clone(), target, method, deadline);
        lock(&self.inner.pending).insert(call)?;

        let bus = Arc::downgrade(&self.inner);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = bus.upgrade() {
                Bus { inner }.expire(&timer_key);
            }
        });
        lock(&self.inner.pending).set_timer(&key, timer.abort_handle());

        Ok(rx)
    }

    /// Resolve an outstanding request. Returns false if it was already
    /// resolved, timed out or cancelled.
    pub fn resolve_pending(&self, source: AgentKind, id: &str, outcome: CallOutcome) -> bool {
        let call = lock(&self.inner.pending).take(&CallKey::new(source, id));
        match call {
            Some(call) => {
                self.complete(call, outcome);
                true
            }
            None => false,
        }
    }

    /// Withdraw an outstanding request; the waiter receives
    /// [`Error::Cancelled`]. Returns false if a reply or the deadline got
    /// there first.
    pub fn cancel_pending(&self, source: AgentKind, id: &str) -> bool {
        let key = CallKey::new(source, id);
        let call = lock(&self.inner.pending).take(&key);
        match call {
            Some(call) => {
                bump(&self.inner.metrics.cancellations);
                debug!(call = %key, target = %call.target, "call cancelled");
                call.resolve(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Number of outstanding calls.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    fn expire(&self, key: &CallKey) {
        let Some(call) = lock(&self.inner.pending).take(key) else {
            return;
        };

        bump(&self.inner.metrics.timeouts);
        lock(&self.inner.routes).record_timeout(call.target);

        let waited = call.deadline.saturating_duration_since(call.registered_at);
        warn!(call = %key, target = %call.target, method = %call.method, ?waited, "call timed out");
        let message = format!(
            "no reply from {} to `{}` within {:?}",
            call.target, call.method, waited
        );
        call.resolve(Err(Error::Timeout(message)));
    }

    fn complete(&self, call: PendingCall, outcome: CallOutcome) {
        {
            let mut routes = lock(&self.inner.routes);
            match &outcome {
                Ok(_) => routes.record_success(call.target, call.registered_at.elapsed()),
                Err(_) => routes.record_failure(call.target),
            }
        }

        let key = call.key.clone();
        if !call.resolve(outcome) {
            debug!(call = %key, "caller went away before its reply");
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Send a request and register it as pending. The returned future
    /// resolves with the reply, [`Error::Timeout`], [`Error::Cancelled`] or
    /// [`Error::UnroutableTarget`].
    pub async fn call(&self, request: Envelope, timeout: Duration) -> Result<ReplyFuture> {
        let target = match (request.kind(), request.target()) {
            (MessageKind::Request, Some(target)) => target,
            (kind, _) => {
                return Err(Error::InvalidParams(format!(
                    "only requests can be called, got {kind}"
                )))
            }
        };

        let deadline = Instant::now() + timeout;
        let rx = self.register_pending(
            request.id(),
            request.source(),
            target,
            request.method(),
            deadline,
        )?;

        // Built before routing so a dropped call future cancels the entry.
        let key = CallKey::new(request.source(), request.id());
        let reply = ReplyFuture {
            bus: self.clone(),
            key: key.clone(),
            target,
            rx,
            finished: false,
        };

        // A full mailbox under `Backpressure::Block` may hold delivery back;
        // the call's deadline bounds that wait too.
        if tokio::time::timeout_at(deadline, self.route_request(request))
            .await
            .is_err()
        {
            debug!(call = %key, %target, "deadline passed while waiting for mailbox space");
            self.expire(&key);
        }
        Ok(reply)
    }

    /// Route an envelope produced in this process.
    pub async fn route(&self, envelope: Envelope) {
        match envelope.kind() {
            MessageKind::Request => self.route_request(envelope).await,
            MessageKind::Response | MessageKind::Error => self.route_terminal(envelope).await,
            MessageKind::Notification => self.route_notification(envelope, false).await,
        }
    }

    /// Route an envelope received from a transport link. Notifications from
    /// the wire only reach local subscribers, so they never bounce between
    /// nodes.
    pub async fn route_inbound(&self, envelope: Envelope) {
        match envelope.kind() {
            MessageKind::Notification => self.route_notification(envelope, true).await,
            _ => self.route(envelope).await,
        }
    }

    async fn route_request(&self, request: Envelope) {
        let Some(target) = request.target() else {
            warn!(id = %request.id(), "request without target dropped");
            return;
        };

        let route = lock(&self.inner.routes).get(target).cloned();
        let Some(route) = route else {
            self.bounce(request, Error::UnroutableTarget(target)).await;
            return;
        };

        debug!(
            id = %request.id(),
            source = %request.source(),
            %target,
            method = %request.method(),
            "routing request"
        );
        match route
            .mailbox
            .deliver(request, self.inner.config.backpressure, target)
            .await
        {
            Ok(()) => bump(&self.inner.metrics.routed),
            Err(Undelivered { envelope, reason }) => self.bounce(envelope, reason).await,
        }
    }

    /// Answer an undeliverable request with an error envelope to its source.
    async fn bounce(&self, request: Envelope, reason: Error) {
        match reason {
            Error::QueueFull(_) => bump(&self.inner.metrics.rejected),
            _ => bump(&self.inner.metrics.unroutable),
        }
        warn!(
            id = %request.id(),
            source = %request.source(),
            method = %request.method(),
            %reason,
            "request not delivered"
        );

        match request.reply_error(reason.to_error_object()) {
            Ok(error) => self.route_terminal(error).await,
            Err(e) => warn!(%e, "cannot bounce request"),
        }
    }

    async fn route_terminal(&self, envelope: Envelope) {
        let Some(caller) = envelope.target() else {
            warn!(id = %envelope.id(), "reply without target dropped");
            return;
        };

        let key = CallKey::new(caller, envelope.id());
        let call = lock(&self.inner.pending).take(&key);
        if let Some(call) = call {
            let target = call.target;
            let outcome = match envelope.into_outcome() {
                Some(Ok(result)) => Ok(result),
                Some(Err(error)) => Err(Error::from_error_object(target, error)),
                None => Err(Error::Protocol("reply without outcome".into())),
            };
            bump(&self.inner.metrics.routed);
            self.complete(call, outcome);
            return;
        }

        // The caller may live on another node.
        let route = lock(&self.inner.routes).get(caller).cloned();
        match route {
            Some(route) if !route.is_local() => {
                let delivered = route
                    .mailbox
                    .deliver(envelope, self.inner.config.backpressure, caller)
                    .await;
                match delivered {
                    Ok(()) => bump(&self.inner.metrics.routed),
                    Err(Undelivered { envelope, reason }) => {
                        bump(&self.inner.metrics.late_replies_dropped);
                        warn!(id = %envelope.id(), %caller, %reason, "reply not forwarded");
                    }
                }
            }
            _ => {
                bump(&self.inner.metrics.late_replies_dropped);
                debug!(call = %key, "dropping reply with no pending call");
            }
        }
    }

    async fn route_notification(&self, envelope: Envelope, local_only: bool) {
        let subscribers = lock(&self.inner.subscriptions).subscribers(envelope.method());
        if subscribers.is_empty() {
            debug!(method = %envelope.method(), "notification without subscribers");
            return;
        }

        let routes: Vec<(AgentKind, Route)> = {
            let table = lock(&self.inner.routes);
            subscribers
                .into_iter()
                .filter_map(|kind| table.get(kind).map(|route| (kind, route.clone())))
                .filter(|(_, route)| !local_only || route.is_local())
                .collect()
        };

        for (kind, route) in routes {
            let delivered = route
                .mailbox
                .deliver(envelope.clone(), self.inner.config.backpressure, kind)
                .await;
            match delivered {
                Ok(()) => bump(&self.inner.metrics.notifications_delivered),
                Err(Undelivered { reason, .. }) => {
                    if matches!(reason, Error::QueueFull(_)) {
                        bump(&self.inner.metrics.rejected);
                    }
                    warn!(
                        subscriber = %kind,
                        method = %envelope.method(),
                        %reason,
                        "notification not delivered"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle and status
    // ------------------------------------------------------------------

    /// Drop every route and subscription and cancel every pending call.
    pub fn shutdown(&self) {
        lock(&self.inner.routes).clear();
        lock(&self.inner.subscriptions).clear();
        let calls = lock(&self.inner.pending).drain();

        let cancelled = calls.len();
        for call in calls {
            bump(&self.inner.metrics.cancellations);
            call.resolve(Err(Error::Cancelled));
        }
        info!(cancelled, "bus shut down");
    }

    /// Activity counters.
    pub fn stats(&self) -> BusStats {
        let m = &self.inner.metrics;
        BusStats {
            routed: m.routed.load(Ordering::Relaxed),
            notifications_delivered: m.notifications_delivered.load(Ordering::Relaxed),
            unroutable: m.unroutable.load(Ordering::Relaxed),
            late_replies_dropped: m.late_replies_dropped.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            cancellations: m.cancellations.load(Ordering::Relaxed),
            rejected: m.rejected.load(Ordering::Relaxed),
            pending_calls: self.pending_count(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Caller-side handle on an outstanding request.
///
/// Resolves exactly once. Dropping it before it resolves cancels the call.
pub struct ReplyFuture {
    bus: Bus,
    key: CallKey,
    target: AgentKind,
    rx: oneshot::Receiver<CallOutcome>,
    finished: bool,
}

impl ReplyFuture {
    /// Id of the request.
    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Agent the request went to.
    pub fn target(&self) -> AgentKind {
        self.target
    }

    /// Withdraw the call. Returns true if the cancellation won; the future
    /// then resolves to [`Error::Cancelled`]. If a reply was already being
    /// delivered, the reply wins and is what the future yields.
    pub fn cancel(&mut self) -> bool {
        self.bus.cancel_pending(self.key.source, &self.key.id)
    }
}

impl Future for ReplyFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.finished = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                self.finished = true;
                Poll::Ready(Err(Error::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReplyFuture {
    fn drop(&mut self) {
        if !self.finished {
            self.bus.cancel_pending(self.key.source, &self.key.id);
        }
    }
}
