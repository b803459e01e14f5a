//! Agent routing table and per-target call statistics.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Error, Result};
use crate::protocol::{AgentKind, Envelope};

/// What a bounded mailbox does when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Suspend the producer until space frees up.
    #[default]
    Block,
    /// Fail the delivery with [`Error::QueueFull`].
    Reject,
}

/// Network address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl PeerAddress {
    /// Create an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("expected host:port, got {s}")))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in {s}")))?;
        Ok(Self::new(host, port))
    }
}

/// Producer side of an agent's inbound queue.
#[derive(Debug, Clone)]
pub enum MailboxSender {
    Unbounded(mpsc::UnboundedSender<Envelope>),
    Bounded(mpsc::Sender<Envelope>),
}

/// Consumer side of an agent's inbound queue.
#[derive(Debug)]
pub enum MailboxReceiver {
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
    Bounded(mpsc::Receiver<Envelope>),
}

/// Create a mailbox. `None` capacity means unbounded.
pub fn mailbox(capacity: Option<usize>) -> (MailboxSender, MailboxReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (MailboxSender::Bounded(tx), MailboxReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (MailboxSender::Unbounded(tx), MailboxReceiver::Unbounded(rx))
        }
    }
}

/// An envelope that could not be enqueued, handed back to the router.
#[derive(Debug)]
pub struct Undelivered {
    /// The envelope.
    pub envelope: Envelope,
    /// Why it was not delivered.
    pub reason: Error,
}

impl MailboxSender {
    /// Enqueue an envelope for `kind`, honouring the backpressure policy.
    pub async fn deliver(
        &self,
        envelope: Envelope,
        policy: Backpressure,
        kind: AgentKind,
    ) -> std::result::Result<(), Undelivered> {
        let closed = |envelope| Undelivered {
            envelope,
            reason: Error::UnroutableTarget(kind),
        };

        match self {
            MailboxSender::Unbounded(tx) => tx.send(envelope).map_err(|e| closed(e.0)),
            MailboxSender::Bounded(tx) => match policy {
                Backpressure::Block => tx.send(envelope).await.map_err(|e| closed(e.0)),
                Backpressure::Reject => tx.try_send(envelope).map_err(|e| match e {
                    TrySendError::Full(envelope) => Undelivered {
                        envelope,
                        reason: Error::QueueFull(kind),
                    },
                    TrySendError::Closed(envelope) => closed(envelope),
                }),
            },
        }
    }

    /// Whether the consumer is gone.
    pub fn is_closed(&self) -> bool {
        match self {
            MailboxSender::Unbounded(tx) => tx.is_closed(),
            MailboxSender::Bounded(tx) => tx.is_closed(),
        }
    }
}

impl MailboxReceiver {
    /// Take the next envelope; `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        match self {
            MailboxReceiver::Unbounded(rx) => rx.recv().await,
            MailboxReceiver::Bounded(rx) => rx.recv().await,
        }
    }

    /// Take the next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        match self {
            MailboxReceiver::Unbounded(rx) => rx.try_recv().ok(),
            MailboxReceiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Where an agent lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// Endpoint in this process.
    Local,
    /// Agent reached through a transport link.
    Remote(PeerAddress),
}

/// One entry of the routing table.
#[derive(Debug, Clone)]
pub struct Route {
    /// Queue envelopes for the agent go to.
    pub mailbox: MailboxSender,
    /// Where the agent lives.
    pub location: Location,
}

impl Route {
    /// Route to an in-process endpoint.
    pub fn local(mailbox: MailboxSender) -> Self {
        Self {
            mailbox,
            location: Location::Local,
        }
    }

    /// Route to a remote agent.
    pub fn remote(mailbox: MailboxSender, peer: PeerAddress) -> Self {
        Self {
            mailbox,
            location: Location::Remote(peer),
        }
    }

    /// Whether the route points at an in-process endpoint.
    pub fn is_local(&self) -> bool {
        self.location == Location::Local
    }
}

/// Routing table keyed by agent identity.
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Live routes.
    routes: HashMap<AgentKind, Route>,
    /// Target health status.
    health: HashMap<AgentKind, TargetHealth>,
    /// Usage statistics.
    stats: HashMap<AgentKind, TargetStats>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the route for an agent.
    pub fn get(&self, kind: AgentKind) -> Option<&Route> {
        self.routes.get(&kind)
    }

    /// Install or replace a route, returning the previous one.
    pub fn set(&mut self, kind: AgentKind, route: Route) -> Option<Route> {
        self.routes.insert(kind, route)
    }

    /// Remove a route.
    pub fn remove(&mut self, kind: AgentKind) -> Option<Route> {
        self.routes.remove(&kind)
    }

    /// Remove every route.
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Agents with a route and where they live.
    pub fn agents(&self) -> Vec<(AgentKind, Location)> {
        let mut agents: Vec<_> = self
            .routes
            .iter()
            .map(|(kind, route)| (*kind, route.location.clone()))
            .collect();
        agents.sort_by_key(|(kind, _)| *kind);
        agents
    }

    /// Routed agents that are currently healthy.
    pub fn available_agents(&self) -> Vec<AgentKind> {
        self.agents()
            .into_iter()
            .map(|(kind, _)| kind)
            .filter(|kind| self.is_healthy(*kind))
            .collect()
    }

    /// Check if a target is healthy.
    pub fn is_healthy(&self, kind: AgentKind) -> bool {
        self.health.get(&kind).map_or(true, |h| h.is_healthy())
    }

    /// Record a successful call.
    pub fn record_success(&mut self, kind: AgentKind, latency: Duration) {
        self.health.entry(kind).or_default().record_success(latency);

        let stats = self.stats.entry(kind).or_default();
        stats.total_calls += 1;
        stats.successful_calls += 1;
    }

    /// Record a call that ended in an error envelope.
    pub fn record_failure(&mut self, kind: AgentKind) {
        self.health.entry(kind).or_default().record_failure();

        let stats = self.stats.entry(kind).or_default();
        stats.total_calls += 1;
        stats.failed_calls += 1;
    }

    /// Record a call that hit its deadline.
    pub fn record_timeout(&mut self, kind: AgentKind) {
        self.health.entry(kind).or_default().record_failure();

        let stats = self.stats.entry(kind).or_default();
        stats.total_calls += 1;
        stats.timed_out_calls += 1;
    }

    /// Statistics for one target, with its current health folded in.
    pub fn stats(&self, kind: AgentKind) -> Option<TargetStats> {
        let mut stats = self.stats.get(&kind).cloned()?;
        if let Some(health) = self.health.get(&kind) {
            stats.consecutive_failures = health.consecutive_failures;
            stats.avg_latency_ms = health.avg_latency.map(|d| d.as_millis() as u64);
            stats.healthy = health.is_healthy();
        }
        Some(stats)
    }
}

/// Health of a call target.
#[derive(Debug, Clone, Default)]
pub struct TargetHealth {
    /// Last successful call time.
    pub last_success: Option<Instant>,
    /// Last failure time.
    pub last_failure: Option<Instant>,
    /// Consecutive failures.
    pub consecutive_failures: u32,
    /// Average latency.
    pub avg_latency: Option<Duration>,
}

impl TargetHealth {
    /// Check if the target is considered healthy.
    pub fn is_healthy(&self) -> bool {
        // Unhealthy if 3+ consecutive failures in last 5 minutes
        if self.consecutive_failures >= 3 {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() < Duration::from_secs(300) {
                    return false;
                }
            }
        }
        true
    }

    /// Record a successful call.
    pub fn record_success(&mut self, latency: Duration) {
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0;

        // Exponential moving average
        self.avg_latency = Some(match self.avg_latency {
            Some(avg) => Duration::from_micros(
                (avg.as_micros() as f64 * 0.9 + latency.as_micros() as f64 * 0.1) as u64,
            ),
            None => latency,
        });
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.consecutive_failures += 1;
    }
}

/// Call statistics for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStats {
    /// Calls that completed in any way.
    pub total_calls: u64,
    /// Calls answered with a response.
    pub successful_calls: u64,
    /// Calls answered with an error envelope.
    pub failed_calls: u64,
    /// Calls that hit their deadline.
    pub timed_out_calls: u64,
    /// Failures and timeouts since the last success.
    pub consecutive_failures: u32,
    /// Moving average of successful call latency.
    pub avg_latency_ms: Option<u64>,
    /// Whether the target is currently considered healthy.
    pub healthy: bool,
}

impl Default for TargetStats {
    fn default() -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            timed_out_calls: 0,
            consecutive_failures: 0,
            avg_latency_ms: None,
            healthy: true,
        }
    }
}
