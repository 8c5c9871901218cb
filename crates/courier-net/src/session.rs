//! Ownership and lifecycle of the single network node used by a scope.
//!
//! ```text
//!  Idle ──acquire──► Bootstrapping ──peers ready──► Ready ──release──► Stopped
//!                        │    ▲                                        ▲
//!                        │    └──────acquire (retry)──┐                │
//!                        └──────error / timeout────► Failed ──release──┘
//! ```
//!
//! The node handle never leaves the manager: callers publish and subscribe
//! through it. Every transition happens under one lock and is broadcast on a
//! watch channel so any number of [`ReadinessHandle`]s can observe it.
//!
//! Releasing while a bootstrap is in flight only marks the session as
//! released. The bootstrap task checks that mark after each step and stops
//! the node itself, so the node is stopped exactly once and never published
//! as ready.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::node::{Node, NodeFactory, NodeOptions, OnMessage, SubscriptionId};

/// Observable state of a network session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Bootstrapping,
    Ready,
    /// Bootstrap failed with this error. `acquire` retries from here.
    Failed(NetError),
    Stopped,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn error(&self) -> Option<&NetError> {
        match self {
            SessionState::Failed(error) => Some(error),
            _ => None,
        }
    }

    fn is_settled(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Bootstrapping)
    }
}

/// A read-only view of a session's state.
#[derive(Debug, Clone)]
pub struct ReadinessHandle {
    rx: watch::Receiver<SessionState>,
}

impl ReadinessHandle {
    pub fn state(&self) -> SessionState {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_ready()
    }

    pub fn error(&self) -> Option<NetError> {
        self.rx.borrow().error().cloned()
    }

    /// Wait until the session leaves `Idle`/`Bootstrapping`.
    ///
    /// A failed bootstrap comes back as the error that ended it, so a timeout
    /// is [`NetError::BootstrapTimeout`]. Dropping the returned future cancels
    /// the wait, not the bootstrap.
    pub async fn wait_ready(&mut self) -> Result<(), NetError> {
        let state = self
            .rx
            .wait_for(SessionState::is_settled)
            .await
            .map_err(|_| NetError::Stopped)?
            .clone();

        match state {
            SessionState::Ready => Ok(()),
            SessionState::Failed(error) => Err(error),
            _ => Err(NetError::Stopped),
        }
    }
}

/// A live subscription made through [`SessionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub id: SubscriptionId,
}

/// Owns one network node for the lifetime of a scope.
///
/// Dropping the manager tears the session down like [`SessionManager::release`].
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    factory: Arc<dyn NodeFactory>,
    options: NodeOptions,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
}

#[derive(Default)]
struct Lifecycle {
    /// Present only while `Ready`.
    node: Option<Arc<dyn Node>>,
    /// Set once by `release`; a released session never becomes ready again.
    released: bool,
    /// Bumped per bootstrap so a stale attempt cannot overwrite a newer one.
    attempt: u64,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn NodeFactory>, options: NodeOptions) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                factory,
                options,
                lifecycle: Mutex::new(Lifecycle::default()),
                state_tx,
            }),
        }
    }

    /// Start the session if it is idle (or failed) and return a view of it.
    ///
    /// Idempotent while bootstrapping or ready. Must be called from within a
    /// tokio runtime; the bootstrap runs on a spawned task.
    pub fn acquire(&self) -> ReadinessHandle {
        let mut lifecycle = lock(&self.inner.lifecycle);
        let restart = !lifecycle.released
            && matches!(
                *self.inner.state_tx.borrow(),
                SessionState::Idle | SessionState::Failed(_)
            );

        if restart {
            lifecycle.attempt += 1;
            let attempt = lifecycle.attempt;
            self.inner.state_tx.send_replace(SessionState::Bootstrapping);
            drop(lifecycle);

            debug!(attempt, "Network session bootstrap scheduled");
            tokio::spawn(bootstrap(self.inner.clone(), attempt));
        }

        self.readiness()
    }

    /// A view of the session without starting it.
    pub fn readiness(&self) -> ReadinessHandle {
        ReadinessHandle {
            rx: self.inner.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Publish `payload` on `topic`.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), NetError> {
        let node = self.ready_node()?;
        node.publish(topic, payload).await.map_err(|e| match e {
            NetError::Publish(_) => e,
            other => NetError::Publish(other.to_string()),
        })
    }

    /// Register `on_message` for every frame received on `topic`.
    ///
    /// The callback may run concurrently with itself and with publishes.
    pub async fn subscribe<F>(&self, topic: &str, on_message: F) -> Result<SubscriptionHandle, NetError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let node = self.ready_node()?;
        let on_message: OnMessage = Arc::new(on_message);
        let id = node.subscribe(topic, on_message).await?;
        debug!(topic = %topic, id = id.0, "Subscribed");
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            id,
        })
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), NetError> {
        let node = self.ready_node()?;
        node.unsubscribe(&handle.topic, handle.id).await
    }

    /// Tear the session down. Idempotent.
    pub async fn release(&self) {
        if let Some(node) = self.inner.mark_released() {
            stop_node(node).await;
        }
    }

    fn ready_node(&self) -> Result<Arc<dyn Node>, NetError> {
        let lifecycle = lock(&self.inner.lifecycle);
        if !self.inner.state_tx.borrow().is_ready() {
            return Err(NetError::NotReady);
        }
        lifecycle.node.clone().ok_or(NetError::NotReady)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let Some(node) = self.inner.mark_released() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(stop_node(node));
            }
            Err(_) => warn!("No runtime available, network node dropped without stop"),
        }
    }
}

impl SessionInner {
    /// Flag the session released and hand back the node to stop, if ready.
    fn mark_released(&self) -> Option<Arc<dyn Node>> {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.released {
            lifecycle.released = true;
            let previous = self.state_tx.send_replace(SessionState::Stopped);
            info!(previous = ?previous, "Network session released");
        }
        lifecycle.node.take()
    }

    fn is_current(&self, lifecycle: &Lifecycle, attempt: u64) -> bool {
        !lifecycle.released && lifecycle.attempt == attempt
    }

    fn abandoned(&self, attempt: u64) -> bool {
        !self.is_current(&lock(&self.lifecycle), attempt)
    }

    fn fail(&self, attempt: u64, error: NetError) {
        let lifecycle = lock(&self.lifecycle);
        if self.is_current(&lifecycle, attempt) {
            warn!(attempt, error = %error, "Network session bootstrap failed");
            self.state_tx.send_replace(SessionState::Failed(error));
        }
    }

    /// Publish `node` as ready unless the attempt was abandoned meanwhile.
    /// Gives the node back when it must be stopped instead.
    fn promote(&self, attempt: u64, node: Arc<dyn Node>) -> Option<Arc<dyn Node>> {
        let mut lifecycle = lock(&self.lifecycle);
        if !self.is_current(&lifecycle, attempt) {
            return Some(node);
        }
        lifecycle.node = Some(node);
        self.state_tx.send_replace(SessionState::Ready);
        None
    }
}

async fn bootstrap(inner: Arc<SessionInner>, attempt: u64) {
    let deadline = Instant::now() + inner.options.bootstrap_timeout;
    let timed_out = || NetError::BootstrapTimeout(inner.options.bootstrap_timeout);

    info!(attempt, "Bootstrapping network session");

    let node = match timeout_at(deadline, inner.factory.create_node(&inner.options)).await {
        Ok(Ok(node)) => node,
        Ok(Err(e)) => return inner.fail(attempt, e),
        Err(_) => return inner.fail(attempt, timed_out()),
    };
    if inner.abandoned(attempt) {
        debug!(attempt, "Bootstrap abandoned after node creation");
        return stop_node(node).await;
    }

    let started = match timeout_at(deadline, node.start()).await {
        Ok(result) => result,
        Err(_) => Err(timed_out()),
    };
    if let Err(e) = started {
        stop_node(node).await;
        return inner.fail(attempt, e);
    }
    if inner.abandoned(attempt) {
        debug!(attempt, "Bootstrap abandoned after node start");
        return stop_node(node).await;
    }

    let capabilities = inner.options.required_capabilities.clone();
    let peers = match timeout_at(deadline, node.wait_for_peers(&capabilities)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out()),
    };
    if let Err(e) = peers {
        stop_node(node).await;
        return inner.fail(attempt, e);
    }

    match inner.promote(attempt, node) {
        None => info!(attempt, "Network session ready"),
        Some(node) => {
            debug!(attempt, "Bootstrap abandoned after peer wait");
            stop_node(node).await;
        }
    }
}

async fn stop_node(node: Arc<dyn Node>) {
    if let Err(e) = node.stop().await {
        warn!(error = %e, "Failed to stop network node");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::node::PeerCapability;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
        published: AtomicUsize,
        subscribed: AtomicUsize,
        unsubscribed: AtomicUsize,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum PeerWait {
        Immediate,
        Gated,
        Never,
        Fail,
    }

    struct MockNode {
        counters: Arc<Counters>,
        peers: PeerWait,
        gate: Arc<Notify>,
        handlers: Mutex<Vec<OnMessage>>,
    }

    #[async_trait]
    impl Node for MockNode {
        async fn start(&self) -> Result<(), NetError> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_for_peers(&self, _capabilities: &[PeerCapability]) -> Result<(), NetError> {
            match self.peers {
                PeerWait::Immediate => Ok(()),
                PeerWait::Gated => {
                    self.gate.notified().await;
                    Ok(())
                }
                PeerWait::Never => std::future::pending().await,
                PeerWait::Fail => Err(NetError::Node("no route".into())),
            }
        }

        async fn stop(&self) -> Result<(), NetError> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<(), NetError> {
            self.counters.published.fetch_add(1, Ordering::SeqCst);
            for handler in lock(&self.handlers).iter() {
                handler(payload.clone());
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            on_message: OnMessage,
        ) -> Result<SubscriptionId, NetError> {
            let n = self.counters.subscribed.fetch_add(1, Ordering::SeqCst);
            lock(&self.handlers).push(on_message);
            Ok(SubscriptionId(n as u64))
        }

        async fn unsubscribe(&self, _topic: &str, _id: SubscriptionId) -> Result<(), NetError> {
            self.counters.unsubscribed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        counters: Arc<Counters>,
        peers: Mutex<PeerWait>,
        gate: Arc<Notify>,
    }

    impl MockFactory {
        fn new(peers: PeerWait) -> Arc<Self> {
            Arc::new(Self {
                counters: Arc::new(Counters::default()),
                peers: Mutex::new(peers),
                gate: Arc::new(Notify::new()),
            })
        }

        fn set_peers(&self, peers: PeerWait) {
            *lock(&self.peers) = peers;
        }

        fn created(&self) -> usize {
            self.counters.created.load(Ordering::SeqCst)
        }

        fn stopped(&self) -> usize {
            self.counters.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NodeFactory for MockFactory {
        async fn create_node(&self, _options: &NodeOptions) -> Result<Arc<dyn Node>, NetError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockNode {
                counters: self.counters.clone(),
                peers: *lock(&self.peers),
                gate: self.gate.clone(),
                handlers: Mutex::new(Vec::new()),
            }))
        }
    }

    fn manager(factory: &Arc<MockFactory>) -> SessionManager {
        let options = NodeOptions {
            bootstrap_timeout: Duration::from_secs(5),
            ..NodeOptions::default()
        };
        SessionManager::new(factory.clone(), options)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_acquire_bootstraps_once() {
        let factory = MockFactory::new(PeerWait::Immediate);
        let session = manager(&factory);
        assert_eq!(session.state(), SessionState::Idle);

        let mut first = session.acquire();
        let mut second = session.acquire();
        first.wait_ready().await.unwrap();
        second.wait_ready().await.unwrap();

        assert!(session.acquire().is_ready());
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.counters.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operations_before_ready_are_rejected() {
        let factory = MockFactory::new(PeerWait::Gated);
        let session = manager(&factory);

        assert_eq!(session.publish("t", vec![1]).await, Err(NetError::NotReady));

        let handle = session.acquire();
        settle().await;
        assert_eq!(handle.state(), SessionState::Bootstrapping);
        assert_eq!(session.publish("t", vec![1]).await, Err(NetError::NotReady));
        assert!(matches!(
            session.subscribe("t", |_data: Vec<u8>| {}).await,
            Err(NetError::NotReady)
        ));
        assert_eq!(factory.counters.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_during_bootstrap_stops_node_once() {
        let factory = MockFactory::new(PeerWait::Gated);
        let session = manager(&factory);

        let mut handle = session.acquire();
        settle().await;
        assert_eq!(factory.created(), 1);

        session.release().await;
        assert_eq!(session.state(), SessionState::Stopped);

        // Let the peer wait finish; the abandoned attempt must not go ready.
        factory.gate.notify_one();
        settle().await;

        assert_eq!(handle.wait_ready().await, Err(NetError::Stopped));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(factory.stopped(), 1);

        session.release().await;
        settle().await;
        assert_eq!(factory.stopped(), 1);
    }

    #[tokio::test]
    async fn test_release_when_ready_stops_node() {
        let factory = MockFactory::new(PeerWait::Immediate);
        let session = manager(&factory);
        session.acquire().wait_ready().await.unwrap();

        session.release().await;
        session.release().await;
        assert_eq!(factory.stopped(), 1);
        assert_eq!(session.publish("t", vec![1]).await, Err(NetError::NotReady));

        // A released session stays stopped.
        let handle = session.acquire();
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_drop_stops_node() {
        let factory = MockFactory::new(PeerWait::Immediate);
        let session = manager(&factory);
        let mut handle = session.acquire();
        handle.wait_ready().await.unwrap();

        drop(session);
        settle().await;
        assert_eq!(factory.stopped(), 1);
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_times_out() {
        let factory = MockFactory::new(PeerWait::Never);
        let session = manager(&factory);

        let mut handle = session.acquire();
        let err = handle.wait_ready().await.unwrap_err();

        assert!(matches!(err, NetError::BootstrapTimeout(_)));
        assert_eq!(err, NetError::BootstrapTimeout(Duration::from_secs(5)));
        assert_eq!(handle.error(), Some(err));
        assert_eq!(factory.stopped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_session_can_be_retried() {
        let factory = MockFactory::new(PeerWait::Never);
        let session = manager(&factory);

        let err = session.acquire().wait_ready().await.unwrap_err();
        assert!(matches!(err, NetError::BootstrapTimeout(_)));

        factory.set_peers(PeerWait::Immediate);
        session.acquire().wait_ready().await.unwrap();
        assert!(session.state().is_ready());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_can_be_retried() {
        let factory = MockFactory::new(PeerWait::Fail);
        let session = manager(&factory);

        let mut handle = session.acquire();
        assert_eq!(
            handle.wait_ready().await,
            Err(NetError::Node("no route".into()))
        );
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert_eq!(factory.stopped(), 1);

        factory.set_peers(PeerWait::Immediate);
        let mut retry = session.acquire();
        retry.wait_ready().await.unwrap();
        assert_eq!(factory.created(), 2);
        assert!(session.state().is_ready());
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_pass_through() {
        let factory = MockFactory::new(PeerWait::Immediate);
        let session = manager(&factory);
        session.acquire().wait_ready().await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        let sub = session
            .subscribe("/courier/1/dm-a-b/proto", move |data: Vec<u8>| {
                assert_eq!(data, vec![7, 7]);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(sub.topic, "/courier/1/dm-a-b/proto");

        session.publish(&sub.topic, vec![7, 7]).await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);

        session.unsubscribe(&sub).await.unwrap();
        assert_eq!(factory.counters.unsubscribed.load(Ordering::SeqCst), 1);
    }
}
