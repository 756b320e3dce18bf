use super::error::{GossipError, Result};
use super::protocol::{call, read_message, write_message};
use super::transport::Transport;
use super::types::{GossipConfig, GossipMessage};
use crate::cmap::{CMap, CMapManager, Node, NodeId, NodeStatus, NodeType};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// How a probe round concluded for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered the direct ping.
    Alive,
    /// The direct ping failed but a relay reached the target.
    AliveIndirect,
    /// Direct and indirect probes failed; the target is now Faulty.
    Faulty,
    /// Probes failed, but a newer claim about the target arrived meanwhile
    /// and the Faulty transition no longer applied.
    Superseded,
}

/// SWIM failure detector and anti-entropy loop for one node.
///
/// The server owns no cluster state of its own: every observation is folded
/// into the shared `CMapManager`, and every decision is taken from a fresh
/// snapshot of it.
pub struct GossipServer<T: Transport> {
    config: GossipConfig,
    manager: Arc<CMapManager>,
    transport: T,
    leaving: AtomicBool,
    /// Suspect records seen locally: incarnation and when it was first seen.
    suspects: DashMap<NodeId, (u64, Instant)>,
}

/// Validates `config` and starts the accept loop and the probe ticker.
///
/// Must be called from within a tokio runtime.
pub fn start_gossip<T: Transport>(
    config: GossipConfig,
    manager: Arc<CMapManager>,
    transport: T,
) -> Result<GossipHandle<T>> {
    let server = GossipServer::new(config, manager, transport)?;
    Ok(server.spawn())
}

impl<T: Transport> GossipServer<T> {
    pub fn new(
        config: GossipConfig,
        manager: Arc<CMapManager>,
        transport: T,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        if manager.latest_snapshot().node(config.node_id).is_none() {
            tracing::warn!(
                "Local node {} is not in cmap v{} yet; gossip runs without self-refutation",
                config.node_id,
                manager.latest_version()
            );
        }

        Ok(Arc::new(Self {
            config,
            manager,
            transport,
            leaving: AtomicBool::new(false),
            suspects: DashMap::new(),
        }))
    }

    /// Starts the background tasks and returns their handle.
    pub fn spawn(self: Arc<Self>) -> GossipHandle<T> {
        tracing::info!(
            "Starting gossip for {} at {} (period {:?}, expire {:?})",
            self.config.node_id,
            self.config.address,
            self.config.ping_period,
            self.config.ping_expire
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_handle = {
            let server = self.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                server.accept_loop(shutdown).await;
            })
        };

        let tick_handle = {
            let server = self.clone();
            tokio::spawn(async move {
                server.tick_loop(shutdown_rx).await;
            })
        };

        GossipHandle {
            server: self,
            shutdown_tx,
            tasks: vec![accept_handle, tick_handle],
        }
    }

    async fn accept_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(conn).await {
                                tracing::warn!("Error handling gossip from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept gossip connection: {}", e);
                        tokio::time::sleep(self.config.ping_expire).await;
                    }
                },
            }
        }
        tracing::debug!("Gossip accept loop stopped");
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.ping_period;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    self.expire_suspects();
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.probe_round().await;
                    });
                }
            }
        }
        tracing::debug!("Gossip tick loop stopped");
    }

    /// Probes one random Alive peer. Returns `None` when there is nobody to probe.
    pub async fn probe_round(self: &Arc<Self>) -> Option<ProbeOutcome> {
        if self.leaving.load(Ordering::SeqCst) {
            return None;
        }

        let snapshot = self.manager.latest_snapshot();
        let Some(target) = self.choose_peers(&snapshot, 1, &[]).pop() else {
            tracing::trace!("No peers to probe in cmap v{}", snapshot.version);
            return None;
        };

        Some(self.probe_node(&target).await)
    }

    /// Runs the full SWIM probe against `target`: direct ping, then Suspect
    /// and indirect probing on failure, then Faulty if no relay succeeds.
    pub async fn probe_node(self: &Arc<Self>, target: &Node) -> ProbeOutcome {
        let snapshot = self.manager.latest_snapshot();

        match self.ping(&target.address, snapshot).await {
            Ok(ack) => {
                tracing::debug!("Probe of {} at {} succeeded", target.id, target.address);
                self.absorb(&ack);
                return ProbeOutcome::Alive;
            }
            Err(e) => {
                tracing::warn!(
                    "Direct probe of {} at {} failed: {}",
                    target.id,
                    target.address,
                    e
                );
            }
        }

        if self.mark_suspect(target.id) {
            self.disseminate();
        }

        if self.indirect_probe(target).await {
            self.clear_suspect(target.id);
            return ProbeOutcome::AliveIndirect;
        }

        if self.mark_faulty(target.id) {
            self.disseminate();
            return ProbeOutcome::Faulty;
        }

        // a merge during the probe already settled the target's status
        match self.manager.latest_snapshot().node(target.id) {
            Some(node) if node.status == NodeStatus::Faulty => ProbeOutcome::Faulty,
            _ => ProbeOutcome::Superseded,
        }
    }

    /// Declares Faulty every node that has been Suspect, at the same
    /// incarnation, for longer than `suspicion_timeout`. Suspicions raised by
    /// other nodes expire here too, so a dead node is resolved even when the node
    /// that raised the suspicion goes away. Returns the nodes declared Faulty.
    pub fn expire_suspects(self: &Arc<Self>) -> Vec<NodeId> {
        if self.leaving.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let snapshot = self.manager.latest_snapshot();
        let now = Instant::now();
        let mut expired = Vec::new();

        self.suspects.retain(|id, _| {
            snapshot
                .node(*id)
                .is_some_and(|node| node.status == NodeStatus::Suspect)
        });

        for node in snapshot.nodes.iter() {
            if node.id == self.config.node_id || node.status != NodeStatus::Suspect {
                continue;
            }

            let mut entry = self
                .suspects
                .entry(node.id)
                .or_insert((node.incarnation, now));
            if entry.0 != node.incarnation {
                *entry = (node.incarnation, now);
            }
            if now.duration_since(entry.1) >= self.config.suspicion_timeout {
                expired.push(node.id);
            }
        }

        let mut promoted = Vec::new();
        for id in expired {
            tracing::warn!(
                "{} stayed Suspect for {:?}, declaring it Faulty",
                id,
                self.config.suspicion_timeout
            );
            if self.mark_faulty(id) {
                self.suspects.remove(&id);
                promoted.push(id);
            }
        }
        if !promoted.is_empty() {
            self.disseminate();
        }
        promoted
    }

    /// Asks up to `indirect_probes` relays to ping `target`. Waits for every
    /// relay unless one succeeds first.
    async fn indirect_probe(self: &Arc<Self>, target: &Node) -> bool {
        let snapshot = self.manager.latest_snapshot();
        let relays = self.choose_peers(&snapshot, self.config.indirect_probes, &[target.id]);
        if relays.is_empty() {
            tracing::warn!("No relays available to probe suspect {}", target.id);
            return false;
        }

        tracing::debug!(
            "Indirect probe of {} through {} relay(s)",
            target.id,
            relays.len()
        );

        let mut probes = JoinSet::new();
        for relay in relays {
            let server = self.clone();
            let cmap = snapshot.clone();
            let target_id = target.id;
            probes.spawn(async move {
                match server.ping_request(&relay, target_id, cmap).await {
                    Ok(ack) => {
                        server.absorb(&ack);
                        true
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Relay {} could not reach {}: {}",
                            relay.id,
                            target_id,
                            e
                        );
                        false
                    }
                }
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(true) => {
                    // remaining relays finish on their own
                    probes.detach_all();
                    return true;
                }
                Ok(false) => {}
                Err(e) => tracing::error!("Indirect probe task failed: {}", e),
            }
        }

        false
    }

    async fn ping(&self, address: &str, cmap: CMap) -> Result<CMap> {
        let request = GossipMessage::Ping {
            from: self.config.node_id,
            cmap,
        };

        match self.exchange(address, &request, self.config.ping_expire).await? {
            GossipMessage::Ack { cmap, .. } => Ok(cmap),
            other => Err(GossipError::UnexpectedReply(other.kind())),
        }
    }

    async fn ping_request(
        self: &Arc<Self>,
        relay: &Node,
        target: NodeId,
        cmap: CMap,
    ) -> Result<CMap> {
        let request = GossipMessage::PingRequest {
            from: self.config.node_id,
            target,
            cmap,
        };

        match self
            .exchange(&relay.address, &request, self.config.relay_expire())
            .await?
        {
            GossipMessage::Ack { cmap, .. } => Ok(cmap),
            GossipMessage::Nack { cmap, .. } => {
                self.absorb(&cmap);
                Err(GossipError::Unreachable(target))
            }
            other => Err(GossipError::UnexpectedReply(other.kind())),
        }
    }

    /// Dial, send one request and read one reply, all within `expire`.
    async fn exchange(
        &self,
        address: &str,
        request: &GossipMessage,
        expire: Duration,
    ) -> Result<GossipMessage> {
        tokio::time::timeout(expire, self.dial_and_call(address, request, expire))
            .await
            .map_err(|_| GossipError::Timeout(expire))?
    }

    async fn dial_and_call(
        &self,
        address: &str,
        request: &GossipMessage,
        expire: Duration,
    ) -> Result<GossipMessage> {
        let mut conn = self.transport.dial(address, expire).await?;
        call(&mut conn, request).await
    }

    async fn handle_connection(self: Arc<Self>, mut conn: T::Conn) -> Result<()> {
        let reply = match read_message(&mut conn).await? {
            GossipMessage::Ping { from, cmap } => {
                tracing::debug!("Received ping from {} (cmap v{})", from, cmap.version);
                self.absorb(&cmap);
                self.ack()
            }
            GossipMessage::PingRequest { from, target, cmap } => {
                tracing::debug!("Received ping request from {} for {}", from, target);
                self.absorb(&cmap);
                self.relay_ping(target).await
            }
            other => {
                tracing::warn!("Ignoring unsolicited {} message", other.kind());
                return Err(GossipError::UnexpectedReply(other.kind()));
            }
        };

        write_message(&mut conn, &reply).await
    }

    fn ack(&self) -> GossipMessage {
        GossipMessage::Ack {
            from: self.config.node_id,
            cmap: self.manager.latest_snapshot(),
        }
    }

    /// Pings `target` for a requester and forwards its Ack, or answers Nack.
    async fn relay_ping(self: &Arc<Self>, target: NodeId) -> GossipMessage {
        let snapshot = self.manager.latest_snapshot();
        let nack = |cmap: CMap| GossipMessage::Nack {
            from: self.config.node_id,
            target,
            cmap,
        };

        let Some(address) = snapshot.node(target).map(|node| node.address.clone()) else {
            tracing::warn!("Ping request for unknown node {}", target);
            return nack(snapshot);
        };

        match self.ping(&address, snapshot).await {
            Ok(ack) => {
                self.absorb(&ack);
                GossipMessage::Ack {
                    from: target,
                    cmap: ack,
                }
            }
            Err(e) => {
                tracing::debug!("Relayed ping to {} at {} failed: {}", target, address, e);
                nack(self.manager.latest_snapshot())
            }
        }
    }

    /// Folds a peer's map into the manager and refutes any suspicion about
    /// the local node found in it.
    fn absorb(self: &Arc<Self>, peer: &CMap) {
        match self.manager.merge_remote(peer) {
            Ok(report) if report.health_changed => {
                tracing::info!("Cluster health changed at cmap v{}", report.version);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "Failed to merge peer cmap v{}, retrying on next exchange: {}",
                    peer.version,
                    e
                );
            }
        }

        self.refute_if_suspected();
    }

    fn refute_if_suspected(self: &Arc<Self>) {
        if self.leaving.load(Ordering::SeqCst) {
            return;
        }

        let local_id = self.config.node_id;
        let status = self
            .manager
            .latest_snapshot()
            .node(local_id)
            .map(|node| node.status);

        match status {
            Some(NodeStatus::Suspect) => {
                let refuted = self.manager.mutate(|cmap| match cmap.node_mut(local_id) {
                    Some(node) if node.status == NodeStatus::Suspect => {
                        node.incarnation += 1;
                        node.status = NodeStatus::Alive;
                        tracing::info!(
                            "Refuting suspicion of {} with incarnation {}",
                            local_id,
                            node.incarnation
                        );
                        true
                    }
                    _ => false,
                });

                match refuted {
                    Ok(Some(_)) => {
                        self.disseminate();
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Failed to refute suspicion: {}", e),
                }
            }
            Some(NodeStatus::Faulty) => {
                tracing::warn!(
                    "Peers declared {} Faulty; an explicit re-join is required",
                    local_id
                );
            }
            _ => {}
        }
    }

    /// Alive -> Suspect, bumping the target's cached incarnation so the claim
    /// wins over the target's last Alive record.
    fn mark_suspect(&self, target: NodeId) -> bool {
        self.transition(target, |node| {
            if node.status != NodeStatus::Alive {
                return false;
            }
            node.status = NodeStatus::Suspect;
            node.incarnation += 1;
            true
        })
    }

    /// Suspect -> Alive after a relay reached the target. The target's own
    /// refutation normally arrives first; this covers relays that forwarded
    /// an Ack without one.
    fn clear_suspect(&self, target: NodeId) {
        self.transition(target, |node| {
            if node.status != NodeStatus::Suspect {
                return false;
            }
            node.status = NodeStatus::Alive;
            true
        });
    }

    fn mark_faulty(&self, target: NodeId) -> bool {
        self.transition(target, |node| {
            if node.status != NodeStatus::Suspect {
                return false;
            }
            node.status = NodeStatus::Faulty;
            true
        })
    }

    fn transition<F>(&self, target: NodeId, edit: F) -> bool
    where
        F: FnOnce(&mut Node) -> bool,
    {
        let result = self
            .manager
            .mutate(|cmap| cmap.node_mut(target).is_some_and(edit));

        match result {
            Ok(Some(version)) => {
                let status = self
                    .manager
                    .latest_snapshot()
                    .node(target)
                    .map(|node| node.status);
                tracing::info!("Node {} is now {:?} (cmap v{})", target, status, version);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!("Failed to commit status change for {}: {}", target, e);
                false
            }
        }
    }

    /// Best-effort push of the current map to a few random Alive peers.
    /// Does not wait for the acks; they are merged as they arrive.
    fn disseminate(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let snapshot = self.manager.latest_snapshot();
        let peers = self.choose_peers(&snapshot, self.config.broadcast_fanout, &[]);

        tracing::debug!(
            "Disseminating cmap v{} to {} peer(s)",
            snapshot.version,
            peers.len()
        );

        peers
            .into_iter()
            .map(|peer| {
                let server = self.clone();
                let cmap = snapshot.clone();
                tokio::spawn(async move {
                    match server.ping(&peer.address, cmap).await {
                        Ok(ack) => server.absorb(&ack),
                        Err(e) => tracing::debug!("Dissemination to {} failed: {}", peer.id, e),
                    }
                })
            })
            .collect()
    }

    /// Random Alive, non-gateway peers other than the local node and `exclude`.
    fn choose_peers(&self, snapshot: &CMap, count: usize, exclude: &[NodeId]) -> Vec<Node> {
        let mut peers: Vec<Node> = snapshot
            .nodes
            .iter()
            .filter(|node| {
                node.id != self.config.node_id
                    && !exclude.contains(&node.id)
                    && node.status == NodeStatus::Alive
                    && node.node_type != NodeType::Gateway
            })
            .cloned()
            .collect();

        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(count);
        peers
    }

    /// Marks the local node Faulty with a self-bumped incarnation and pushes
    /// the change to a few peers, waiting at most `relay_expire` for them.
    pub async fn leave(self: &Arc<Self>) -> Result<()> {
        self.leaving.store(true, Ordering::SeqCst);

        let local_id = self.config.node_id;
        let committed = self.manager.mutate(|cmap| match cmap.node_mut(local_id) {
            Some(node) if node.status != NodeStatus::Faulty => {
                node.incarnation += 1;
                node.status = NodeStatus::Faulty;
                true
            }
            _ => false,
        })?;

        let Some(version) = committed else {
            return Ok(());
        };
        tracing::info!("{} leaving the cluster at cmap v{}", local_id, version);

        let pushes = self.disseminate();
        let deadline = self.config.relay_expire();
        let _ = tokio::time::timeout(deadline, async {
            for push in pushes {
                let _ = push.await;
            }
        })
        .await;

        Ok(())
    }
}

/// Controls a running gossip server.
pub struct GossipHandle<T: Transport> {
    server: Arc<GossipServer<T>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> GossipHandle<T> {
    pub fn server(&self) -> &Arc<GossipServer<T>> {
        &self.server
    }

    /// Announces departure, then stops the background tasks.
    pub async fn leave(self) -> Result<()> {
        let left = self.server.leave().await;
        self.shutdown().await;
        left
    }

    /// Stops the background tasks without announcing anything.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Gossip task ended abnormally: {}", e);
            }
        }
    }
}
