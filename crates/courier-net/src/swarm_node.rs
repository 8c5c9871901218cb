//! [`Node`] implementation backed by the libp2p swarm task.
//!
//! Frames arriving on the notification channel are fanned out to the
//! handlers registered per topic. The swarm itself only learns about a topic
//! when its first handler is registered and forgets it with the last one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_shared::constants::KDF_CONTEXT_NODE_KEY;

use crate::error::NetError;
use crate::node::{Node, NodeFactory, NodeOptions, OnMessage, PeerCapability, SubscriptionId};
use crate::swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmHandle, SwarmNotification};

/// How often `wait_for_peers` re-checks the peer tracker.
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on waiting for the swarm task to release its sockets.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`SwarmNode`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwarmNodeFactory;

#[async_trait]
impl NodeFactory for SwarmNodeFactory {
    async fn create_node(&self, options: &NodeOptions) -> Result<Arc<dyn Node>, NetError> {
        let keypair = match options.key_seed.as_deref() {
            Some(seed) => keypair_from_seed(seed)?,
            None => Keypair::generate_ed25519(),
        };

        let config = SwarmConfig {
            bootstrap_peers_path: options.bootstrap_peers_path.clone(),
            listen_port: options.listen_port,
            extra_dials: options.bootstrap_peers.clone(),
        };

        Ok(Arc::new(SwarmNode::new(keypair, config)))
    }
}

/// Derive a stable ed25519 node key from a seed phrase.
pub fn keypair_from_seed(seed: &str) -> Result<Keypair, NetError> {
    let secret = blake3::derive_key(KDF_CONTEXT_NODE_KEY, seed.as_bytes());
    Keypair::ed25519_from_bytes(secret).map_err(|e| NetError::Node(format!("Invalid node key: {e}")))
}

struct Running {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    swarm_task: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    peer_id: PeerId,
}

/// A libp2p swarm plus the handler registry feeding subscribers.
pub struct SwarmNode {
    keypair: Keypair,
    config: SwarmConfig,
    running: Mutex<Option<Running>>,
    handlers: Arc<HandlerRegistry>,
}

impl SwarmNode {
    pub fn new(keypair: Keypair, config: SwarmConfig) -> Self {
        Self {
            keypair,
            config,
            running: Mutex::new(None),
            handlers: Arc::new(HandlerRegistry::default()),
        }
    }

    /// Local peer id, once started.
    pub fn peer_id(&self) -> Option<PeerId> {
        lock(&self.running).as_ref().map(|r| r.peer_id)
    }

    fn cmd_tx(&self) -> Result<mpsc::Sender<SwarmCommand>, NetError> {
        lock(&self.running)
            .as_ref()
            .map(|r| r.cmd_tx.clone())
            .ok_or(NetError::NotReady)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand,
    ) -> Result<T, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx()?
            .send(make(reply_tx))
            .await
            .map_err(|_| NetError::ChannelClosed)?;
        reply_rx.await.map_err(|_| NetError::ChannelClosed)
    }
}

#[async_trait]
impl Node for SwarmNode {
    async fn start(&self) -> Result<(), NetError> {
        if lock(&self.running).is_some() {
            return Ok(());
        }

        let SwarmHandle {
            cmd_tx,
            notif_rx,
            peer_id,
            task: swarm_task,
        } = spawn_swarm(self.keypair.clone(), self.config.clone())
            .await
            .map_err(|e| NetError::Node(format!("Failed to spawn swarm: {e}")))?;

        let handlers = self.handlers.clone();
        let dispatcher = tokio::spawn(dispatch_notifications(handlers, notif_rx));

        info!(peer_id = %peer_id, "Swarm node started");
        *lock(&self.running) = Some(Running {
            cmd_tx,
            swarm_task,
            dispatcher,
            peer_id,
        });
        Ok(())
    }

    async fn wait_for_peers(&self, capabilities: &[PeerCapability]) -> Result<(), NetError> {
        loop {
            let capable = self
                .request(|reply| SwarmCommand::GetCapablePeers {
                    capabilities: capabilities.to_vec(),
                    reply,
                })
                .await?;
            if !capable.is_empty() {
                info!(count = capable.len(), "Capable peers available");
                return Ok(());
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self) -> Result<(), NetError> {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return Ok(());
        };

        if running.cmd_tx.send(SwarmCommand::Shutdown).await.is_err() {
            debug!("Swarm task already gone");
        }
        // The listen port stays bound until the swarm itself is dropped.
        let mut swarm_task = running.swarm_task;
        match tokio::time::timeout(STOP_TIMEOUT, &mut swarm_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Swarm task ended abnormally"),
            Err(_) => {
                warn!("Swarm task did not stop in time, aborting");
                swarm_task.abort();
            }
        }
        running.dispatcher.abort();
        self.handlers.clear();
        info!(peer_id = %running.peer_id, "Swarm node stopped");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), NetError> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::PublishMessage {
            topic,
            data: payload,
            reply,
        })
        .await?
        .map_err(NetError::Publish)
    }

    async fn subscribe(
        &self,
        topic: &str,
        on_message: OnMessage,
    ) -> Result<SubscriptionId, NetError> {
        let (id, first) = self.handlers.add(topic, on_message);
        if first {
            let result = self
                .request(|reply| SwarmCommand::SubscribeTopic {
                    topic: topic.to_string(),
                    reply,
                })
                .await
                .and_then(|r| r.map_err(NetError::Subscribe));
            if let Err(e) = result {
                self.handlers.remove(topic, id);
                return Err(e);
            }
        }
        debug!(topic = %topic, id = id.0, "Handler registered");
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), NetError> {
        if self.handlers.remove(topic, id) {
            self.cmd_tx()?
                .send(SwarmCommand::UnsubscribeTopic(topic.to_string()))
                .await
                .map_err(|_| NetError::ChannelClosed)?;
        }
        Ok(())
    }
}

async fn dispatch_notifications(
    handlers: Arc<HandlerRegistry>,
    mut notif_rx: mpsc::Receiver<SwarmNotification>,
) {
    while let Some(notification) = notif_rx.recv().await {
        match notification {
            SwarmNotification::MessageReceived { source, topic, data } => {
                let delivered = handlers.dispatch(&topic, &data);
                if delivered == 0 {
                    debug!(topic = %topic, source = ?source, "No handler for topic, dropping frame");
                }
            }
            SwarmNotification::PeerConnected { peer_id, address } => {
                debug!(peer = %peer_id, addr = %address, "Peer connected (node)");
            }
            SwarmNotification::PeerDisconnected { peer_id } => {
                debug!(peer = %peer_id, "Peer disconnected (node)");
            }
        }
    }
    warn!("Swarm notification loop ended");
}

/// Per-topic handler lists.
#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, OnMessage)>>>,
}

impl HandlerRegistry {
    /// Returns the new id and whether it is the topic's first handler.
    fn add(&self, topic: &str, handler: OnMessage) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_string()).or_default();
        entry.push((id, handler));
        (id, entry.len() == 1)
    }

    /// Returns true when the topic has no handlers left.
    fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = lock(&self.topics);
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        let removed = entry.len() < before;
        if entry.is_empty() {
            topics.remove(topic);
        }
        removed && !topics.contains_key(topic)
    }

    /// Hand `data` to each handler on `topic` once. Returns the handler count.
    fn dispatch(&self, topic: &str, data: &[u8]) -> usize {
        let handlers: Vec<OnMessage> = lock(&self.topics)
            .get(topic)
            .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(data.to_vec());
        }
        handlers.len()
    }

    fn clear(&self) {
        lock(&self.topics).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
