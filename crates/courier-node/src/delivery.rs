//! Sending and receiving direct messages.
//!
//! Outbound: derive the pair topic, encode, publish through the session, then
//! append to the local log. Inbound: every subscribed topic pushes raw frames
//! onto one channel, drained by a single task that decodes, filters,
//! deduplicates, persists and notifies in that order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_net::{NetError, SessionManager, SubscriptionHandle};
use courier_shared::protocol::{decode, encode, Message};
use courier_shared::{normalize_address, DecodeError, DmTopic, LocalIdentity, TopicError};
use courier_store::{
    aggregate_conversations, ConversationSummary, MessageLog, Notification, Notifier, ReadTarget,
    StoreError,
};

/// How many recent message ids the inbound task remembers.
pub const SEEN_WINDOW: usize = 4096;

/// Capacity of the stored-message broadcast.
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A raw frame as it came off a topic.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: String,
    pub data: Vec<u8>,
}

/// What the inbound pipeline did with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Persisted and notified.
    Stored(String),
    /// Already seen or already in the log.
    Duplicate(String),
    /// Our own message coming back.
    OwnEcho,
    /// Decoded fine but meant for someone else, or sent on the wrong topic.
    NotForUs,
    /// Undecodable.
    Dropped(DecodeError),
    /// The log rejected it; a redelivery will be tried again.
    Failed,
}

/// Bounded memory of recently handled message ids, evicted oldest first.
#[derive(Debug)]
pub struct SeenWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    max_size: usize,
}

impl SeenWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(max_size.min(1024)),
            order: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Returns false when `message_id` was already present.
    pub fn insert(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return false;
        }
        while self.order.len() >= self.max_size {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The decode → filter → dedup → persist → notify chain for inbound frames.
pub struct InboundPipeline<L> {
    identity: LocalIdentity,
    store: Arc<Mutex<L>>,
    notifier: Arc<dyn Notifier + Send + Sync>,
    seen: SeenWindow,
    events: broadcast::Sender<Message>,
}

impl<L: MessageLog> InboundPipeline<L> {
    pub fn new(
        identity: LocalIdentity,
        store: Arc<Mutex<L>>,
        notifier: Arc<dyn Notifier + Send + Sync>,
        events: broadcast::Sender<Message>,
    ) -> Self {
        Self {
            identity,
            store,
            notifier,
            seen: SeenWindow::new(SEEN_WINDOW),
            events,
        }
    }

    pub fn handle(&mut self, frame: &InboundFrame) -> Disposition {
        let message = match decode(&frame.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %frame.topic, len = frame.data.len(), error = %e, "Dropping undecodable frame");
                return Disposition::Dropped(e);
            }
        };

        if self.identity.owns_address(&message.sender_address) {
            return Disposition::OwnEcho;
        }
        if !self.identity.owns_address(&message.receiver_address) {
            debug!(message_id = %message.message_id, "Frame not addressed to us");
            return Disposition::NotForUs;
        }
        let topic_counterpart = DmTopic::parse(&frame.topic)
            .and_then(|topic| topic.counterpart_of(&self.identity.address).map(str::to_string));
        let sender = normalize_address(&message.sender_address).ok();
        if topic_counterpart.is_none() || topic_counterpart != sender {
            warn!(
                topic = %frame.topic,
                message_id = %message.message_id,
                "Message arrived on a topic that does not match its parties"
            );
            return Disposition::NotForUs;
        }

        if self.seen.contains(&message.message_id) {
            return Disposition::Duplicate(message.message_id);
        }

        let inserted = match lock(&self.store).append_message(&message) {
            Ok(inserted) => inserted,
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "Failed to persist inbound message");
                return Disposition::Failed;
            }
        };
        self.seen.insert(&message.message_id);

        if !inserted {
            return Disposition::Duplicate(message.message_id);
        }

        if let Err(e) = self.notifier.notify(&Notification::for_message(&message)) {
            warn!(message_id = %message.message_id, error = %e, "Failed to notify");
        }

        info!(
            from = %message.sender_address,
            message_id = %message.message_id,
            "Message received"
        );
        let message_id = message.message_id.clone();
        // No receivers is fine.
        let _ = self.events.send(message);
        Disposition::Stored(message_id)
    }
}

/// Owns the conversation subscriptions and the inbound task for one identity.
pub struct DeliveryCoordinator<L> {
    identity: LocalIdentity,
    session: Arc<SessionManager>,
    store: Arc<Mutex<L>>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    subscriptions: tokio::sync::Mutex<HashMap<String, SubscriptionHandle>>,
    events: broadcast::Sender<Message>,
    inbound_task: JoinHandle<()>,
}

impl<L> DeliveryCoordinator<L>
where
    L: MessageLog + Send + 'static,
{
    /// Spawn the inbound task. Must be called from within a tokio runtime.
    pub fn new(
        identity: LocalIdentity,
        session: Arc<SessionManager>,
        store: Arc<Mutex<L>>,
        notifier: Arc<dyn Notifier + Send + Sync>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let pipeline = InboundPipeline::new(identity.clone(), store.clone(), notifier, events.clone());
        let inbound_task = tokio::spawn(run_inbound(pipeline, inbound_rx));

        Self {
            identity,
            session,
            store,
            inbound_tx,
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            events,
            inbound_task,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Messages persisted by the inbound task, as they are stored.
    pub fn received(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Send `content` to `receiver_address` and record it locally.
    ///
    /// Also makes sure we are listening on the pair topic for replies.
    pub async fn send(
        &self,
        receiver_id: &str,
        receiver_address: &str,
        content: &str,
    ) -> Result<Message, DeliveryError> {
        let draft = self.identity.draft_to(receiver_id, receiver_address, content)?;
        let topic = self.identity.topic_with(&draft.receiver_address)?.to_topic();

        let encoded = encode(draft);
        self.session.publish(&topic, encoded.bytes).await?;
        debug!(topic = %topic, message_id = %encoded.message.message_id, "Message published");

        lock(&self.store).append_message(&encoded.message)?;

        if let Err(e) = self.open_conversation(receiver_address).await {
            warn!(error = %e, "Could not subscribe for replies");
        }
        Ok(encoded.message)
    }

    /// Start receiving on the topic shared with `counterpart_address`.
    /// Returns the topic. Idempotent.
    pub async fn open_conversation(&self, counterpart_address: &str) -> Result<String, DeliveryError> {
        let topic = self.identity.topic_with(counterpart_address)?.to_topic();

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&topic) {
            return Ok(topic);
        }

        let tx = self.inbound_tx.clone();
        let frame_topic = topic.clone();
        let handle = self
            .session
            .subscribe(&topic, move |data: Vec<u8>| {
                let frame = InboundFrame {
                    topic: frame_topic.clone(),
                    data,
                };
                if tx.send(frame).is_err() {
                    debug!("Inbound task gone, frame discarded");
                }
            })
            .await?;

        info!(topic = %topic, "Conversation opened");
        subscriptions.insert(topic.clone(), handle);
        Ok(topic)
    }

    /// Stop receiving on the topic shared with `counterpart_address`.
    pub async fn close_conversation(&self, counterpart_address: &str) -> Result<(), DeliveryError> {
        let topic = self.identity.topic_with(counterpart_address)?.to_topic();
        let handle = self.subscriptions.lock().await.remove(&topic);
        if let Some(handle) = handle {
            self.session.unsubscribe(&handle).await?;
            info!(topic = %topic, "Conversation closed");
        }
        Ok(())
    }

    /// Topics currently subscribed.
    pub async fn open_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Re-open every conversation already present in the log.
    /// Returns how many subscriptions succeeded.
    pub async fn resubscribe_known(&self) -> Result<usize, DeliveryError> {
        let counterparts = self.known_counterparts()?;
        let mut opened = 0;
        for address in &counterparts {
            match self.open_conversation(address).await {
                Ok(_) => opened += 1,
                Err(e) => warn!(counterpart = %address, error = %e, "Failed to reopen conversation"),
            }
        }
        info!(opened, known = counterparts.len(), "Known conversations reopened");
        Ok(opened)
    }

    pub fn conversations(&self) -> Result<Vec<ConversationSummary>, DeliveryError> {
        let store = lock(&self.store);
        let sent = store.find_messages_by_sender(&self.identity.user_id)?;
        let received = store.find_messages_by_receiver(&self.identity.user_id)?;
        Ok(aggregate_conversations(&sent, &received))
    }

    pub fn mark_read(&self, target: &ReadTarget) -> Result<usize, DeliveryError> {
        Ok(lock(&self.store).mark_read(target)?)
    }

    /// Mark everything we have received as read.
    pub fn mark_all_read(&self) -> Result<usize, DeliveryError> {
        self.mark_read(&ReadTarget::AllFor(self.identity.user_id.clone()))
    }

    fn known_counterparts(&self) -> Result<Vec<String>, DeliveryError> {
        let mut addresses = lock(&self.store).counterpart_addresses(&self.identity.user_id)?;
        addresses.retain(|address| !self.identity.owns_address(address));
        Ok(addresses)
    }
}

impl<L> Drop for DeliveryCoordinator<L> {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}

async fn run_inbound<L: MessageLog>(
    mut pipeline: InboundPipeline<L>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
) {
    while let Some(frame) = inbound_rx.recv().await {
        let disposition = pipeline.handle(&frame);
        debug!(topic = %frame.topic, ?disposition, "Inbound frame handled");
    }
    debug!("Inbound queue closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::protocol::MessageDraft;
    use courier_store::Database;

    struct Fixture {
        store: Arc<Mutex<Database>>,
        pipeline: InboundPipeline<Database>,
        events: broadcast::Receiver<Message>,
    }

    fn bob() -> LocalIdentity {
        LocalIdentity::new("bob", "0xb0b", Some("Bob".into())).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let (tx, events) = broadcast::channel(16);
        let pipeline = InboundPipeline::new(bob(), store.clone(), store.clone(), tx);
        Fixture {
            store,
            pipeline,
            events,
        }
    }

    fn from_alice(content: &str) -> Message {
        MessageDraft {
            sender_id: "alice".into(),
            sender_address: "0xa11ce".into(),
            sender_name: Some("Alice".into()),
            receiver_id: "bob".into(),
            receiver_address: "0xb0b".into(),
            content: content.into(),
        }
        .seal()
    }

    fn frame(message: &Message) -> InboundFrame {
        let topic = DmTopic::between(&message.sender_address, &message.receiver_address)
            .unwrap()
            .to_topic();
        InboundFrame {
            topic,
            data: message.to_bytes(),
        }
    }

    #[test]
    fn test_seen_window_evicts_oldest() {
        let mut window = SeenWindow::new(2);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.insert("a"));
        assert!(window.insert("c"));
        assert!(!window.contains("a"));
        assert!(window.contains("b"));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_inbound_message_is_stored_and_notified() {
        let mut fx = fixture();
        let message = from_alice("hello bob");

        let disposition = fx.pipeline.handle(&frame(&message));
        assert_eq!(disposition, Disposition::Stored(message.message_id.clone()));
        assert_eq!(fx.events.try_recv().unwrap(), message);

        let db = fx.store.lock().unwrap();
        let received = db.find_messages_by_receiver("bob").unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.content, "hello bob");

        let notifications = db.unseen_notifications("bob").unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].actor_id, "alice");
    }

    #[test]
    fn test_duplicate_delivery_persists_once() {
        let mut fx = fixture();
        let message = from_alice("once");
        let f = frame(&message);

        assert!(matches!(fx.pipeline.handle(&f), Disposition::Stored(_)));
        assert_eq!(fx.pipeline.handle(&f), Disposition::Duplicate(message.message_id.clone()));

        let db = fx.store.lock().unwrap();
        assert_eq!(db.find_messages_by_receiver("bob").unwrap().len(), 1);
        assert_eq!(db.unseen_notifications("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_outside_window_is_caught_by_store() {
        let mut fx = fixture();
        let message = from_alice("replayed");
        fx.store.lock().unwrap().append_message(&message).unwrap();

        assert_eq!(
            fx.pipeline.handle(&frame(&message)),
            Disposition::Duplicate(message.message_id.clone())
        );
        assert!(fx.store.lock().unwrap().unseen_notifications("bob").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut fx = fixture();
        let garbage = InboundFrame {
            topic: "/courier/1/dm-0xa11ce-0xb0b/proto".into(),
            data: vec![0xff; 16],
        };
        assert!(matches!(fx.pipeline.handle(&garbage), Disposition::Dropped(_)));

        let empty = InboundFrame {
            topic: garbage.topic.clone(),
            data: Vec::new(),
        };
        assert_eq!(fx.pipeline.handle(&empty), Disposition::Dropped(DecodeError::Empty));

        // The pipeline keeps working afterwards.
        let message = from_alice("still here");
        assert!(matches!(fx.pipeline.handle(&frame(&message)), Disposition::Stored(_)));
    }

    #[test]
    fn test_own_echo_and_foreign_frames_are_skipped() {
        let mut fx = fixture();

        let mut echo = from_alice("mine");
        echo.sender_address = "0xB0B".into();
        echo.receiver_address = "0xa11ce".into();
        assert_eq!(fx.pipeline.handle(&frame(&echo)), Disposition::OwnEcho);

        let mut foreign = from_alice("not yours");
        foreign.receiver_address = "0xcafe".into();
        assert_eq!(fx.pipeline.handle(&frame(&foreign)), Disposition::NotForUs);

        let message = from_alice("wrong topic");
        let misrouted = InboundFrame {
            topic: DmTopic::between("0xb0b", "0xcafe").unwrap().to_topic(),
            data: message.to_bytes(),
        };
        assert_eq!(fx.pipeline.handle(&misrouted), Disposition::NotForUs);

        assert!(fx.store.lock().unwrap().find_messages_by_receiver("bob").unwrap().is_empty());
    }

    #[test]
    fn test_sender_is_matched_against_topic_counterpart() {
        let mut fx = fixture();

        let mut shouting = from_alice("case differs");
        shouting.sender_address = "0xA11CE".into();
        let f = InboundFrame {
            topic: "/courier/1/dm-0xa11ce-0xb0b/proto".into(),
            data: shouting.to_bytes(),
        };
        assert!(matches!(fx.pipeline.handle(&f), Disposition::Stored(_)));

        let message = from_alice("not a dm topic");
        let odd = InboundFrame {
            topic: "/courier/1/general/proto".into(),
            data: message.to_bytes(),
        };
        assert_eq!(fx.pipeline.handle(&odd), Disposition::NotForUs);
    }
}
