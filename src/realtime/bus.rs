//! In-process event bus fanning change events out to live subscribers.
//!
//! Every subscriber owns a bounded queue drained by its streaming response.
//! Broadcasting never waits on a subscriber: a full queue drops the frame for
//! that subscriber only, a closed queue removes the subscriber.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hostpilot_realtime_types::{ChangeEvent, ConnectedFrame};
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 64;

const METRIC_CLIENTS: &str = "hostpilot_realtime_clients";
const METRIC_DELIVERED: &str = "hostpilot_realtime_frames_delivered_total";
const METRIC_DROPPED: &str = "hostpilot_realtime_frames_dropped_total";
const METRIC_PRUNED: &str = "hostpilot_realtime_clients_pruned_total";

/// Event bus tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
    pub client_queue_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

impl From<&crate::config::RealtimeSettings> for RealtimeConfig {
    fn from(settings: &crate::config::RealtimeSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval,
            client_queue_capacity: settings.client_queue_capacity.get(),
        }
    }
}

/// One queued write to a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A serialized JSON object, shared between all recipients.
    Data(Arc<str>),
    /// Keep-alive comment.
    Heartbeat,
}

struct ClientHandle {
    organization_id: Option<i64>,
    sender: mpsc::Sender<Frame>,
    heartbeat: JoinHandle<()>,
}

impl ClientHandle {
    fn accepts(&self, organization_id: Option<i64>) -> bool {
        match (self.organization_id, organization_id) {
            (Some(scope), Some(event_org)) => scope == event_org,
            _ => true,
        }
    }
}

/// Registry of connected subscribers. One per server process.
pub struct EventBus {
    config: RealtimeConfig,
    clients: DashMap<String, ClientHandle>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber scoped to `organization_id`.
    ///
    /// The returned subscription already holds the `connected` handshake
    /// frame and starts receiving broadcasts immediately. Dropping it
    /// unregisters the subscriber.
    pub fn add_client(self: &Arc<Self>, organization_id: Option<i64>) -> Subscription {
        let client_id = self.next_client_id();
        let (sender, receiver) = mpsc::channel(self.config.client_queue_capacity.max(1));

        match serde_json::to_string(&ConnectedFrame::new(client_id.clone())) {
            Ok(handshake) => {
                // The queue is fresh, so the first frame always fits.
                let _ = sender.try_send(Frame::Data(Arc::from(handshake)));
            }
            Err(err) => {
                error!(client_id = %client_id, error = %err, "Failed to encode handshake");
            }
        }

        let heartbeat = spawn_heartbeat(
            client_id.clone(),
            sender.clone(),
            self.config.heartbeat_interval,
        );
        self.clients.insert(
            client_id.clone(),
            ClientHandle {
                organization_id,
                sender,
                heartbeat,
            },
        );

        let clients = self.clients.len();
        gauge!(METRIC_CLIENTS).set(clients as f64);
        info!(
            client_id = %client_id,
            organization_id = ?organization_id,
            clients,
            "Client connected"
        );

        Subscription {
            client_id,
            receiver,
            bus: Arc::clone(self),
        }
    }

    /// Unregister a subscriber and stop its heartbeat.
    ///
    /// Returns false when the client was already gone.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let Some((_, handle)) = self.clients.remove(client_id) else {
            return false;
        };
        handle.heartbeat.abort();

        let clients = self.clients.len();
        gauge!(METRIC_CLIENTS).set(clients as f64);
        info!(client_id = %client_id, clients, "Client disconnected");
        true
    }

    /// Stamp `event` with the current time and queue it for every subscriber
    /// in the same organization.
    pub fn broadcast(&self, event: ChangeEvent) {
        let resource = event.resource;
        let organization_id = event.organization_id;
        let event = event.stamp(now_millis());

        let frame = match serde_json::to_string(&event) {
            Ok(json) => Frame::Data(Arc::from(json)),
            Err(err) => {
                error!(%resource, error = %err, "Failed to encode event");
                return;
            }
        };

        let mut delivered = 0usize;
        let mut closed = Vec::new();
        for entry in self.clients.iter() {
            let handle = entry.value();
            if !handle.accepts(organization_id) {
                continue;
            }
            match handle.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    counter!(METRIC_DROPPED).increment(1);
                    warn!(
                        client_id = %entry.key(),
                        %resource,
                        "Subscriber queue full; frame dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        // Removal happens after iteration; DashMap shards are still read-locked above.
        for client_id in &closed {
            if self.remove_client(client_id) {
                counter!(METRIC_PRUNED).increment(1);
            }
        }

        counter!(METRIC_DELIVERED).increment(delivered as u64);
        debug!(
            %resource,
            action = %event.action,
            organization_id = ?organization_id,
            delivered,
            pruned = closed.len(),
            "Broadcast event"
        );
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Drop every subscriber so that open streams end.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for client_id in &ids {
            self.remove_client(client_id);
        }
        if !ids.is_empty() {
            info!(closed = ids.len(), "Closed all subscribers");
        }
    }

    fn next_client_id(&self) -> String {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("client_{counter}_{}", now_millis())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(RealtimeConfig::default())
    }
}

fn spawn_heartbeat(
    client_id: String,
    sender: mpsc::Sender<Frame>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sender.try_send(Frame::Heartbeat) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(client_id = %client_id, "Heartbeat skipped; queue full");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    })
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// The receiving side of one registered subscriber.
pub struct Subscription {
    client_id: String,
    receiver: mpsc::Receiver<Frame>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next queued frame, or `None` once the subscriber has been removed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting frames as if the transport had gone away.
    #[cfg(test)]
    pub(crate) fn close_receiver(&mut self) {
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove_client(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use hostpilot_realtime_types::{RealtimeAction, ResourceType, StreamMessage};

    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::default())
    }

    fn data(frame: Option<Frame>) -> StreamMessage {
        match frame {
            Some(Frame::Data(json)) => StreamMessage::parse(&json).expect("valid frame"),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    fn booking_update(organization_id: i64) -> ChangeEvent {
        ChangeEvent::new(ResourceType::Booking, RealtimeAction::Update)
            .with_entity(7)
            .with_organization(organization_id)
    }

    #[tokio::test]
    async fn first_frame_is_connected_handshake() {
        let bus = bus();
        let mut sub = bus.add_client(Some(42));

        let StreamMessage::Connected { client_id } = data(sub.try_recv()) else {
            panic!("expected handshake");
        };
        assert_eq!(client_id, sub.client_id());
        assert!(client_id.starts_with("client_1_"));
    }

    #[tokio::test]
    async fn events_stay_within_organization() {
        let bus = bus();
        let mut s1 = bus.add_client(Some(42));
        let mut s2 = bus.add_client(Some(43));
        s1.try_recv();
        s2.try_recv();

        bus.broadcast(booking_update(42));

        let StreamMessage::Event(event) = data(s1.try_recv()) else {
            panic!("expected event");
        };
        assert_eq!(event.resource, ResourceType::Booking);
        assert_eq!(event.organization_id, Some(42));
        assert!(event.timestamp > 0);
        assert!(s2.try_recv().is_none());
    }

    #[tokio::test]
    async fn unscoped_clients_and_events_match_all() {
        let bus = bus();
        let mut unscoped = bus.add_client(None);
        let mut scoped = bus.add_client(Some(5));
        unscoped.try_recv();
        scoped.try_recv();

        bus.broadcast(booking_update(9));
        bus.broadcast(ChangeEvent::new(ResourceType::Settings, RealtimeAction::Bulk));

        assert!(matches!(unscoped.try_recv(), Some(Frame::Data(_))));
        assert!(matches!(unscoped.try_recv(), Some(Frame::Data(_))));
        let StreamMessage::Event(event) = data(scoped.try_recv()) else {
            panic!("expected event");
        };
        assert_eq!(event.resource, ResourceType::Settings);
        assert!(scoped.try_recv().is_none());
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned_without_affecting_others() {
        let bus = bus();
        let mut healthy_a = bus.add_client(Some(42));
        let mut dead = bus.add_client(Some(42));
        let mut healthy_b = bus.add_client(Some(42));
        for sub in [&mut healthy_a, &mut dead, &mut healthy_b] {
            sub.try_recv();
        }
        dead.close_receiver();

        bus.broadcast(booking_update(42));

        assert!(matches!(healthy_a.try_recv(), Some(Frame::Data(_))));
        assert!(matches!(healthy_b.try_recv(), Some(Frame::Data(_))));
        assert_eq!(bus.client_count(), 2);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_frames_but_stays_registered() {
        let bus = Arc::new(EventBus::new(RealtimeConfig {
            client_queue_capacity: 2,
            ..Default::default()
        }));
        let mut slow = bus.add_client(Some(1));

        bus.broadcast(booking_update(1));
        bus.broadcast(booking_update(1));

        assert_eq!(bus.client_count(), 1);
        assert!(matches!(data(slow.try_recv()), StreamMessage::Connected { .. }));
        assert!(matches!(data(slow.try_recv()), StreamMessage::Event(_)));
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_client() {
        let bus = bus();
        let sub = bus.add_client(Some(1));
        let id = sub.client_id().to_string();
        assert_eq!(bus.client_count(), 1);

        drop(sub);

        assert_eq!(bus.client_count(), 0);
        assert!(!bus.remove_client(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_queued_every_interval() {
        let bus = bus();
        let mut sub = bus.add_client(None);
        sub.try_recv();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(sub.try_recv().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sub.try_recv(), Some(Frame::Heartbeat));
    }

    #[tokio::test]
    async fn close_all_ends_open_streams() {
        let bus = bus();
        let mut sub = bus.add_client(Some(3));
        sub.try_recv();

        bus.close_all();

        assert_eq!(bus.client_count(), 0);
        assert_eq!(sub.recv().await, None);
    }
}
