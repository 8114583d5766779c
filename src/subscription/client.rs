//! Subscription state machine.
//!
//! One [`SubscriptionClient`] keeps a single stream open per session. A
//! driver task owns the transport and the reconnect loop; a debouncer task
//! owns the pending invalidation set. Both are torn down by
//! [`SubscriptionClient::disconnect`].

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use hostpilot_realtime_types::{RealtimeEvent, ResourceType, StreamMessage};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::config::SubscriptionConfig;
use super::debounce::{InvalidationSink, run_debouncer};
use super::policy::ReconnectPolicy;
use super::transport::{EventTransport, SseFrame, TransportError};

const METRIC_RECONNECTS: &str = "hostpilot_subscription_reconnects_total";
const METRIC_EVENTS: &str = "hostpilot_subscription_events_total";

/// Side-channel callback invoked for every parsed domain event.
pub type EventObserver = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnects exhausted; only an explicit `connect` retries.
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Disconnected => write!(f, "disconnected"),
            SubscriptionState::Connecting => write!(f, "connecting"),
            SubscriptionState::Connected => write!(f, "connected"),
            SubscriptionState::Failed => write!(f, "failed"),
        }
    }
}

struct Running {
    driver: JoinHandle<()>,
    debouncer: JoinHandle<()>,
}

impl Running {
    fn is_active(&self) -> bool {
        !self.driver.is_finished()
    }

    fn abort(self) {
        self.driver.abort();
        self.debouncer.abort();
    }
}

/// Keeps one realtime subscription alive and feeds the invalidation sink.
pub struct SubscriptionClient {
    config: SubscriptionConfig,
    transport: Arc<dyn EventTransport>,
    sink: Arc<dyn InvalidationSink>,
    observer: Option<EventObserver>,
    organization_id: Option<i64>,
    state: watch::Sender<SubscriptionState>,
    client_id: watch::Sender<Option<String>>,
    running: Option<Running>,
}

impl SubscriptionClient {
    pub fn new(
        config: SubscriptionConfig,
        transport: Arc<dyn EventTransport>,
        sink: Arc<dyn InvalidationSink>,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        let (client_id, _) = watch::channel(None);
        Self {
            config,
            transport,
            sink,
            observer: None,
            organization_id: None,
            state,
            client_id,
            running: None,
        }
    }

    pub fn with_organization(mut self, organization_id: Option<i64>) -> Self {
        self.organization_id = organization_id;
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Id assigned by the server's handshake on the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.borrow().clone()
    }

    pub fn organization_id(&self) -> Option<i64> {
        self.organization_id
    }

    /// Start the subscription. A live subscription is left alone; a failed
    /// or stopped one starts over from attempt zero.
    pub fn connect(&mut self) {
        if self.running.as_ref().is_some_and(Running::is_active) {
            return;
        }
        if let Some(stale) = self.running.take() {
            stale.abort();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let debouncer = tokio::spawn(run_debouncer(
            self.config.debounce(),
            events_rx,
            Arc::clone(&self.sink),
        ));
        let driver = tokio::spawn(drive(Driver {
            transport: Arc::clone(&self.transport),
            policy: ReconnectPolicy::from(&self.config),
            organization_id: self.organization_id,
            observer: self.observer.clone(),
            state: self.state.clone(),
            client_id: self.client_id.clone(),
            events: events_tx,
        }));

        info!(organization_id = ?self.organization_id, "Subscription started");
        self.running = Some(Running { driver, debouncer });
    }

    /// Tear down the transport, reconnect timer and pending debounce.
    pub fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.abort();
            info!(organization_id = ?self.organization_id, "Subscription stopped");
        }
        self.client_id.send_replace(None);
        self.state.send_replace(SubscriptionState::Disconnected);
    }

    /// Switch organization scope, reconnecting when the scope changed while
    /// a subscription was running.
    pub fn set_organization(&mut self, organization_id: Option<i64>) {
        if self.organization_id == organization_id {
            return;
        }
        let was_running = self.running.is_some();
        self.disconnect();
        self.organization_id = organization_id;
        if was_running {
            self.connect();
        }
    }
}

impl Drop for SubscriptionClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.abort();
        }
    }
}

struct Driver {
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    organization_id: Option<i64>,
    observer: Option<EventObserver>,
    state: watch::Sender<SubscriptionState>,
    client_id: watch::Sender<Option<String>>,
    events: mpsc::UnboundedSender<ResourceType>,
}

async fn drive(driver: Driver) {
    let mut attempts: u32 = 0;
    loop {
        driver.state.send_replace(SubscriptionState::Connecting);

        let error = match driver.transport.open(driver.organization_id).await {
            Ok(mut frames) => {
                attempts = 0;
                driver.state.send_replace(SubscriptionState::Connected);
                info!(organization_id = ?driver.organization_id, "Subscription connected");

                loop {
                    match frames.next().await {
                        Some(Ok(frame)) => driver.handle(frame),
                        Some(Err(err)) => break err,
                        None => break TransportError::Closed,
                    }
                }
            }
            Err(err) => err,
        };

        driver.client_id.send_replace(None);
        driver.state.send_replace(SubscriptionState::Disconnected);

        match driver.policy.next_delay(attempts) {
            Some(delay) => {
                attempts += 1;
                counter!(METRIC_RECONNECTS).increment(1);
                warn!(
                    error = %error,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Subscription lost; reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(
                    error = %error,
                    attempts,
                    "Subscription failed; reconnect attempts exhausted"
                );
                driver.state.send_replace(SubscriptionState::Failed);
                return;
            }
        }
    }
}

impl Driver {
    fn handle(&self, frame: SseFrame) {
        let data = match frame {
            SseFrame::Data(data) => data,
            SseFrame::Comment(comment) => {
                trace!(comment = %comment, "Keep-alive");
                return;
            }
        };

        match StreamMessage::parse(&data) {
            Ok(StreamMessage::Connected { client_id }) => {
                debug!(client_id = %client_id, "Handshake received");
                self.client_id.send_replace(Some(client_id));
            }
            Ok(StreamMessage::Event(event)) => {
                counter!(METRIC_EVENTS, "resource" => event.resource.as_str()).increment(1);
                if let Some(observer) = &self.observer {
                    observer(&event);
                }
                // The debouncer only goes away together with this driver.
                let _ = self.events.send(event.resource);
            }
            Err(err) => {
                warn!(error = %err, frame = %data, "Dropping malformed frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::super::debounce::tests::RecordingSink;
    use super::super::transport::FrameStream;
    use super::*;

    type FrameSender = mpsc::UnboundedSender<Result<SseFrame, TransportError>>;

    enum Step {
        Fail,
        Open(mpsc::UnboundedReceiver<Result<SseFrame, TransportError>>),
    }

    /// Plays back scripted connection outcomes; fails once the script ends.
    #[derive(Default)]
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        opens: Mutex<Vec<(Instant, Option<i64>)>>,
    }

    impl ScriptedTransport {
        fn failing() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn push_open(&self) -> FrameSender {
            let (tx, rx) = mpsc::unbounded_channel();
            self.steps.lock().expect("lock").push_back(Step::Open(rx));
            tx
        }

        fn push_fail(&self) {
            self.steps.lock().expect("lock").push_back(Step::Fail);
        }

        fn opens(&self) -> Vec<(Instant, Option<i64>)> {
            self.opens.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn open(&self, organization_id: Option<i64>) -> Result<FrameStream, TransportError> {
            self.opens
                .lock()
                .expect("lock")
                .push((Instant::now(), organization_id));
            let step = self.steps.lock().expect("lock").pop_front();
            match step {
                Some(Step::Open(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
                Some(Step::Fail) | None => Err(TransportError::Connect("refused".into())),
            }
        }
    }

    fn data(json: &str) -> Result<SseFrame, TransportError> {
        Ok(SseFrame::Data(json.to_string()))
    }

    fn event(resource: &str) -> Result<SseFrame, TransportError> {
        data(&format!(
            r#"{{"type":"{resource}","action":"update","organizationId":42,"timestamp":1}}"#
        ))
    }

    fn client(
        transport: Arc<ScriptedTransport>,
        sink: Arc<RecordingSink>,
        max_attempts: u32,
    ) -> SubscriptionClient {
        let config = SubscriptionConfig {
            max_reconnect_attempts: max_attempts,
            ..Default::default()
        };
        SubscriptionClient::new(config, transport, sink).with_organization(Some(42))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_records_client_id() {
        let transport = ScriptedTransport::failing();
        let frames = transport.push_open();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 10);

        client.connect();
        frames
            .send(data(r#"{"type":"connected","clientId":"client_1_99"}"#))
            .expect("driver running");
        settle().await;

        assert_eq!(client.state(), SubscriptionState::Connected);
        assert_eq!(client.client_id().as_deref(), Some("client_1_99"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_is_invalidated_once() {
        let transport = ScriptedTransport::failing();
        let frames = transport.push_open();
        let sink = Arc::new(RecordingSink::default());
        let mut client = client(transport.clone(), sink.clone(), 10);
        client.connect();

        for _ in 0..5 {
            frames.send(event("booking")).expect("driver running");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.resources(), vec![ResourceType::Booking]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_and_observer_sees_events() {
        let transport = ScriptedTransport::failing();
        let frames = transport.push_open();
        let sink = Arc::new(RecordingSink::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = Arc::clone(&seen);
        let mut client = client(transport.clone(), sink.clone(), 10).with_observer(Arc::new(
            move |event: &RealtimeEvent| {
                seen_by_observer.lock().expect("lock").push(event.resource);
            },
        ));
        client.connect();

        frames.send(data("not json")).expect("driver running");
        frames.send(data(r#"{"type":"spaceship","action":"update","timestamp":1}"#))
            .expect("driver running");
        frames.send(Ok(SseFrame::Comment("heartbeat".into())))
            .expect("driver running");
        frames.send(event("finance")).expect("driver running");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(client.state(), SubscriptionState::Connected);
        assert_eq!(*seen.lock().expect("lock"), vec![ResourceType::Finance]);
        assert_eq!(sink.resources(), vec![ResourceType::Finance]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_double_each_failure() {
        let transport = ScriptedTransport::failing();
        let frames = transport.push_open();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 10);
        client.connect();
        settle().await;
        assert_eq!(client.state(), SubscriptionState::Connected);

        let closed_at = Instant::now();
        drop(frames);
        tokio::time::sleep(Duration::from_millis(7_500)).await;

        let opens = transport.opens();
        assert_eq!(opens.len(), 4);
        assert_eq!(opens[1].0 - closed_at, Duration::from_millis(1_000));
        assert_eq!(opens[2].0 - opens[1].0, Duration::from_millis(2_000));
        assert_eq!(opens[3].0 - opens[2].0, Duration::from_millis(4_000));
        assert!(opens.iter().all(|(_, organization)| *organization == Some(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = ScriptedTransport::failing();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 3);
        let mut state = client.subscribe_state();

        client.connect();
        state
            .wait_for(|state| *state == SubscriptionState::Failed)
            .await
            .expect("state channel open");
        let attempts = transport.opens().len();
        tokio::time::sleep(Duration::from_secs(600)).await;

        // Initial open plus three reconnects, then nothing.
        assert_eq!(attempts, 4);
        assert_eq!(transport.opens().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_failure_starts_over() {
        let transport = ScriptedTransport::failing();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 1);
        let mut state = client.subscribe_state();
        client.connect();
        state
            .wait_for(|state| *state == SubscriptionState::Failed)
            .await
            .expect("state channel open");

        let _frames = transport.push_open();
        client.connect();
        settle().await;

        assert_eq!(client.state(), SubscriptionState::Connected);
        assert_eq!(transport.opens().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_reconnect_and_pending_invalidations() {
        let transport = ScriptedTransport::failing();
        let frames = transport.push_open();
        transport.push_fail();
        let sink = Arc::new(RecordingSink::default());
        let mut client = client(transport.clone(), sink.clone(), 10);
        client.connect();

        frames.send(event("task")).expect("driver running");
        settle().await;
        client.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(client.state(), SubscriptionState::Disconnected);
        assert!(sink.resources().is_empty());
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn organization_change_reconnects_with_new_scope() {
        let transport = ScriptedTransport::failing();
        let _first = transport.push_open();
        let _second = transport.push_open();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 10);
        client.connect();
        settle().await;

        client.set_organization(Some(42));
        client.set_organization(Some(43));
        settle().await;

        let scopes: Vec<_> = transport.opens().into_iter().map(|(_, org)| org).collect();
        assert_eq!(scopes, vec![Some(42), Some(43)]);
        assert_eq!(client.state(), SubscriptionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn organization_change_while_stopped_does_not_connect() {
        let transport = ScriptedTransport::failing();
        let mut client = client(transport.clone(), Arc::new(RecordingSink::default()), 10);

        client.set_organization(Some(7));
        settle().await;

        assert_eq!(client.organization_id(), Some(7));
        assert!(transport.opens().is_empty());
        assert_eq!(client.state(), SubscriptionState::Disconnected);
    }
}
