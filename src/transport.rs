//! Newline-delimited envelope transport over TCP.
//!
//! Links are one-directional: a node writes to an agent through a
//! [`RemoteLink`] and reads whatever its peers send through its [`Listener`].
//! Replies travel back over the answering node's own link to the caller.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::protocol::{decode, encode, AgentKind};
use crate::router::{mailbox, Location, MailboxReceiver, PeerAddress, Route};

/// Accepts connections from peer nodes and routes what they send.
pub struct Listener {
    bus: Bus,
    listener: TcpListener,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(bus: &Bus, addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            bus: bus.clone(),
            listener,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the socket fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "listening for peers");
        loop {
            let (stream, remote) = self.listener.accept().await?;
            debug!(%remote, "peer connected");
            let bus = self.bus.clone();
            tokio::spawn(async move {
                if let Err(e) = read_envelopes(&bus, stream).await {
                    warn!(%remote, %e, "peer connection failed");
                }
                debug!(%remote, "peer disconnected");
            });
        }
    }
}

/// Bind `addr` and serve until the socket fails.
pub async fn serve(bus: &Bus, addr: impl ToSocketAddrs) -> Result<()> {
    Listener::bind(bus, addr).await?.run().await
}

async fn read_envelopes<R>(bus: &Bus, reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match decode(line.as_bytes()) {
            Ok(envelope) => bus.route_inbound(envelope).await,
            Err(e) => warn!(%e, "skipping undecodable line"),
        }
    }
    Ok(())
}

async fn write_envelopes(mut outbox: MailboxReceiver, stream: TcpStream, kind: AgentKind) {
    let mut writer = BufWriter::new(stream);
    while let Some(envelope) = outbox.recv().await {
        let mut line = match encode(&envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!(agent = %kind, id = %envelope.id(), %e, "cannot encode envelope");
                continue;
            }
        };
        line.push(b'\n');

        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(agent = %kind, %e, "link write failed, closing");
            return;
        }
    }
    debug!(agent = %kind, "link drained");
}

/// Outbound connection carrying every envelope addressed to one remote
/// agent.
pub struct RemoteLink {
    bus: Bus,
    kind: AgentKind,
    peer: PeerAddress,
    writer: JoinHandle<()>,
}

impl RemoteLink {
    /// Connect to `peer` and route `kind` through the connection.
    pub async fn connect(bus: &Bus, kind: AgentKind, peer: PeerAddress) -> Result<Self> {
        let writer = open(bus, kind, &peer).await?;
        Ok(Self {
            bus: bus.clone(),
            kind,
            peer,
            writer,
        })
    }

    /// Replace the connection. Calls already waiting on `kind` stay pending
    /// and can still be answered.
    pub async fn reconnect(&mut self, peer: PeerAddress) -> Result<()> {
        // The old writer drains once the route no longer holds its sender.
        self.writer = open(&self.bus, self.kind, &peer).await?;
        info!(agent = %self.kind, from = %self.peer, to = %peer, "link reconnected");
        self.peer = peer;
        Ok(())
    }

    /// Agent served by this link.
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Current peer address.
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Whether the writer task is still running.
    pub fn is_open(&self) -> bool {
        !self.writer.is_finished()
    }

    /// Remove the route if it still points at this link.
    pub fn close(self) {
        let ours = Location::Remote(self.peer.clone());
        let current = self
            .bus
            .agents()
            .into_iter()
            .find(|(kind, _)| *kind == self.kind);
        if matches!(current, Some((_, location)) if location == ours) {
            self.bus.remove_route(self.kind);
        }
        info!(agent = %self.kind, peer = %self.peer, "link closed");
    }
}

async fn open(bus: &Bus, kind: AgentKind, peer: &PeerAddress) -> Result<JoinHandle<()>> {
    let addr = peer.to_string();
    let stream = tokio::time::timeout(bus.config().connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {kind} at {peer}")))??;
    stream.set_nodelay(true)?;

    let (tx, rx) = mailbox(bus.config().mailbox_capacity);
    bus.set_route(kind, Route::remote(tx, peer.clone()));
    info!(agent = %kind, %peer, "link established");

    Ok(tokio::spawn(write_envelopes(rx, stream, kind)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::endpoint::Endpoint;
    use crate::protocol::{Envelope, Params};
    use serde_json::json;
    use tokio::sync::mpsc;

    const SECOND: Duration = Duration::from_secs(1);

    fn peer(addr: SocketAddr) -> PeerAddress {
        PeerAddress::new(addr.ip().to_string(), addr.port())
    }

    async fn listen(bus: &Bus) -> PeerAddress {
        let listener = Listener::bind(bus, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());
        peer(addr)
    }

    struct Nodes {
        vision_bus: Bus,
        vision: Endpoint,
        vision_addr: PeerAddress,
        orchestrator_bus: Bus,
        orchestrator: Endpoint,
        link: RemoteLink,
    }

    /// Vision on one node, orchestrator on another, linked both ways.
    async fn two_nodes() -> Nodes {
        let vision_bus = Bus::default();
        let vision = Endpoint::attach(&vision_bus, AgentKind::Vision).unwrap();
        vision
            .register_fn("ping", |_| async { Ok(json!({"pong": true})) })
            .unwrap();
        tokio::spawn({
            let vision = vision.clone();
            async move { vision.run().await }
        });
        let vision_addr = listen(&vision_bus).await;

        let orchestrator_bus = Bus::default();
        let orchestrator = Endpoint::attach(&orchestrator_bus, AgentKind::Orchestrator).unwrap();
        let orchestrator_addr = listen(&orchestrator_bus).await;

        let link = RemoteLink::connect(&orchestrator_bus, AgentKind::Vision, vision_addr.clone())
            .await
            .unwrap();
        let back = RemoteLink::connect(&vision_bus, AgentKind::Orchestrator, orchestrator_addr)
            .await
            .unwrap();
        assert!(back.is_open());

        Nodes {
            vision_bus,
            vision,
            vision_addr,
            orchestrator_bus,
            orchestrator,
            link,
        }
    }

    #[tokio::test]
    async fn test_request_across_nodes() {
        let nodes = two_nodes().await;

        let result = nodes
            .orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
        assert_eq!(nodes.orchestrator_bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_across_nodes() {
        let nodes = two_nodes().await;
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        nodes
            .vision
            .subscribe_fn("status", move |params| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(params).ok();
                    Ok(())
                }
            })
            .unwrap();
        // The publishing node needs to know who listens.
        nodes.orchestrator_bus.subscribe("status", AgentKind::Vision);

        let mut params = Params::new();
        params.insert("state".into(), json!("ready"));
        nodes.orchestrator.publish("status", params).await.unwrap();

        let got = tokio::time::timeout(SECOND, seen.recv()).await.unwrap().unwrap();
        assert_eq!(got["state"], "ready");
        assert_eq!(nodes.vision_bus.stats().notifications_delivered, 1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_serving() {
        let mut nodes = two_nodes().await;
        nodes.link.reconnect(nodes.vision_addr.clone()).await.unwrap();
        assert_eq!(nodes.link.peer(), &nodes.vision_addr);

        let result = nodes
            .orchestrator
            .send_request(AgentKind::Vision, "ping", Params::new(), SECOND)
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));

        nodes.link.close();
        assert!(!nodes.orchestrator_bus.has_route(AgentKind::Vision));
    }

    #[tokio::test]
    async fn test_undecodable_line_skipped() {
        let bus = Bus::default();
        let mut vision = bus.attach(AgentKind::Vision).unwrap();
        let addr = listen(&bus).await;

        let envelope = Envelope::request(
            AgentKind::Orchestrator,
            AgentKind::Vision,
            "ping",
            Params::new(),
        );
        let mut raw = TcpStream::connect(addr.to_string()).await.unwrap();
        raw.write_all(b"{not json}\n\n").await.unwrap();
        let mut line = encode(&envelope).unwrap();
        line.push(b'\n');
        raw.write_all(&line).await.unwrap();

        let delivered = tokio::time::timeout(SECOND, vision.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, envelope);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let bus = Bus::default();
        let unused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = RemoteLink::connect(&bus, AgentKind::Vision, peer(unused))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io(_) | Error::Timeout(_)));
        assert!(!bus.has_route(AgentKind::Vision));
    }
}
