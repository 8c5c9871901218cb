//! The libp2p swarm task and its typed channels.
//!
//! One tokio task owns the [`Swarm`]. Callers send [`SwarmCommand`]s in and
//! read [`SwarmNotification`]s out; commands that can fail carry a oneshot
//! for the outcome.

use std::path::PathBuf;

use futures::StreamExt;
use libp2p::gossipsub::IdentTopic;
use libp2p::identity::Keypair;
use libp2p::{gossipsub, identify, kad, swarm::SwarmEvent, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_shared::constants::DEFAULT_QUIC_PORT;

use crate::behaviour::{CourierBehaviour, CourierEvent};
use crate::discovery::{extract_peer_id, load_bootstrap_peers};
use crate::node::PeerCapability;
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

const CHANNEL_CAPACITY: usize = 256;

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    PublishMessage {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SubscribeTopic {
        topic: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    UnsubscribeTopic(String),
    /// Connected peers offering every listed capability.
    GetCapablePeers {
        capabilities: Vec<PeerCapability>,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

/// Notifications sent *from* the swarm task.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected { peer_id: PeerId, address: Multiaddr },
    PeerDisconnected { peer_id: PeerId },
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
}

/// Where to listen and whom to dial first.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// File of bootstrap multiaddrs, one per line.
    pub bootstrap_peers_path: Option<PathBuf>,
    /// UDP port for QUIC on every interface. `0` picks a free port.
    pub listen_port: u16,
    /// Multiaddrs dialed at startup in addition to the file's.
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            extra_dials: Vec::new(),
        }
    }
}

impl SwarmConfig {
    fn bootstrap_addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.extra_dials.clone();
        if let Some(path) = &self.bootstrap_peers_path {
            addrs.extend(load_bootstrap_peers(path));
        }
        addrs
    }
}

/// A running swarm task and its channels.
pub struct SwarmHandle {
    pub cmd_tx: mpsc::Sender<SwarmCommand>,
    pub notif_rx: mpsc::Receiver<SwarmNotification>,
    pub peer_id: PeerId,
    /// Completes once the swarm is dropped and its listeners are closed.
    pub task: JoinHandle<()>,
}

/// Build the swarm, start listening and dialing, and run it on its own task.
///
/// The task ends on [`SwarmCommand::Shutdown`] or once every command sender
/// is dropped.
pub async fn spawn_swarm(keypair: Keypair, config: SwarmConfig) -> anyhow::Result<SwarmHandle> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    listen(&mut swarm, config.listen_port)?;
    dial_bootstrap(&mut swarm, &config.bootstrap_addrs());

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let driver = SwarmDriver {
        swarm,
        peers: PeerTracker::new(),
        notif_tx,
    };
    let task = tokio::spawn(driver.run(cmd_rx));

    Ok(SwarmHandle {
        cmd_tx,
        notif_rx,
        peer_id: local_peer_id,
        task,
    })
}

fn listen(swarm: &mut Swarm<CourierBehaviour>, port: u16) -> anyhow::Result<()> {
    let v4: Multiaddr = format!("/ip4/0.0.0.0/udp/{port}/quic-v1").parse()?;
    swarm.listen_on(v4)?;

    let v6: Multiaddr = format!("/ip6/::/udp/{port}/quic-v1").parse()?;
    if let Err(e) = swarm.listen_on(v6) {
        warn!(error = %e, "IPv6 listen failed, continuing with IPv4 only");
    }

    info!(peer_id = %swarm.local_peer_id(), port, "Swarm listening");
    Ok(())
}

fn dial_bootstrap(swarm: &mut Swarm<CourierBehaviour>, addrs: &[Multiaddr]) {
    let mut dialed = 0usize;
    for addr in addrs {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            continue;
        }
        dialed += 1;
        // Without a /p2p suffix the peer can be dialed but not routed to.
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
    }

    if dialed == 0 {
        if !addrs.is_empty() {
            warn!(count = addrs.len(), "No bootstrap peer could be dialed");
        }
        return;
    }
    debug!(dialed, "Bootstrap dials started");
    if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
        warn!(error = %e, "Kademlia bootstrap failed to start");
    }
}

struct SwarmDriver {
    swarm: Swarm<CourierBehaviour>,
    peers: PeerTracker,
    notif_tx: mpsc::Sender<SwarmNotification>,
}

impl SwarmDriver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SwarmCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SwarmCommand::Shutdown) => {
                        info!("Swarm shutdown requested");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("Command channel closed, shutting down swarm");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_event(event).await,
            }
        }
        info!("Swarm event loop terminated");
    }

    fn handle_command(&mut self, cmd: SwarmCommand) {
        let gossipsub = &mut self.swarm.behaviour_mut().gossipsub;
        match cmd {
            SwarmCommand::PublishMessage { topic, data, reply } => {
                let result = match gossipsub.publish(IdentTopic::new(&topic), data) {
                    Ok(id) => {
                        debug!(topic = %topic, message_id = %id, "Published");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Publish failed");
                        Err(e.to_string())
                    }
                };
                let _ = reply.send(result);
            }
            SwarmCommand::SubscribeTopic { topic, reply } => {
                let result = match gossipsub.subscribe(&IdentTopic::new(&topic)) {
                    Ok(fresh) => {
                        debug!(topic = %topic, fresh, "Joined topic");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Subscribe failed");
                        Err(e.to_string())
                    }
                };
                let _ = reply.send(result);
            }
            SwarmCommand::UnsubscribeTopic(topic) => {
                let _ = gossipsub.unsubscribe(&IdentTopic::new(&topic));
                debug!(topic = %topic, "Left topic");
            }
            SwarmCommand::GetCapablePeers { capabilities, reply } => {
                let _ = reply.send(self.peers.capable_peers(&capabilities));
            }
            SwarmCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<CourierEvent>) {
        match event {
            SwarmEvent::Behaviour(CourierEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                debug!(
                    topic = %message.topic,
                    source = ?message.source,
                    len = message.data.len(),
                    "GossipSub message received"
                );
                let notification = SwarmNotification::MessageReceived {
                    source: message.source,
                    topic: message.topic.into_string(),
                    data: message.data,
                };
                notify(&self.notif_tx, notification).await;
            }

            SwarmEvent::Behaviour(CourierEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                debug!(peer = %peer_id, topic = %topic, "Peer joined topic");
            }

            SwarmEvent::Behaviour(CourierEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                for addr in &info.listen_addrs {
                    kademlia.add_address(&peer_id, addr.clone());
                }
                let protocols: Vec<String> = info.protocols.iter().map(ToString::to_string).collect();
                debug!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    protocols = protocols.len(),
                    "Identified peer"
                );
                self.peers.on_identified(peer_id, protocols);
            }

            SwarmEvent::Behaviour(CourierEvent::Kademlia(
                kad::Event::OutboundQueryProgressed { result, .. },
            )) => {
                debug!(result = ?result, "Kademlia query progressed");
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                let address = endpoint.get_remote_address().clone();
                self.peers.on_connected(peer_id, address.clone());
                info!(peer = %peer_id, addr = %address, "Peer connected");
                notify(&self.notif_tx, SwarmNotification::PeerConnected { peer_id, address }).await;
            }

            // Only the last closed connection counts as a disconnect.
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                self.peers.on_disconnected(&peer_id);
                info!(peer = %peer_id, "Peer disconnected");
                notify(&self.notif_tx, SwarmNotification::PeerDisconnected { peer_id }).await;
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
            }

            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(error = %error, "Incoming connection error");
            }

            _ => {}
        }
    }
}

/// Borrows only the sender. `Swarm` is not `Sync`, so a `&SwarmDriver` held
/// across this await would make the task `!Send`.
async fn notify(notif_tx: &mpsc::Sender<SwarmNotification>, notification: SwarmNotification) {
    if notif_tx.send(notification).await.is_err() {
        debug!("Notification receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_driver_future_is_send() {
        let swarm = build_swarm(Keypair::generate_ed25519()).unwrap();
        let (notif_tx, _notif_rx) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let driver = SwarmDriver {
            swarm,
            peers: PeerTracker::new(),
            notif_tx,
        };
        assert_send(&driver.run(cmd_rx));
    }

    #[tokio::test]
    async fn test_shutdown_ends_task() {
        let config = SwarmConfig {
            listen_port: 0,
            ..SwarmConfig::default()
        };
        let handle = spawn_swarm(Keypair::generate_ed25519(), config).await.unwrap();
        handle.cmd_tx.send(SwarmCommand::Shutdown).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.task)
            .await
            .expect("swarm task did not stop")
            .unwrap();
    }
}
