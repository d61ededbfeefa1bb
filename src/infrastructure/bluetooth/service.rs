//! Link Manager
//!
//! Single state machine driving discovery, connect-with-fallback, and the
//! connection lifecycle. Every input (caller requests, discovery events,
//! connect results, channel closure) arrives as a [`LinkEvent`] on one queue
//! and is handled in order by [`LinkManager::run`].

use crate::domain::models::{
    AppEvent, ConnectionState, DeviceDescriptor, DeviceTarget, DiscoveryEvent,
};
use crate::infrastructure::bluetooth::channel::StreamChannel;
use crate::infrastructure::bluetooth::connection::{
    connect_with_fallback, ConnectionStrategy, Streams,
};
use crate::infrastructure::bluetooth::error::LinkError;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Platform hook that starts and stops device discovery.
///
/// Implementations report what they find through the [`DiscoverySink`] and
/// must finish every started discovery with
/// [`DiscoveryEvent::DiscoveryFinished`], including after a cancel.
pub trait DiscoveryPlatform: Send {
    fn start_discovery(&mut self, sink: DiscoverySink) -> Result<(), LinkError>;
    fn cancel_discovery(&mut self);
}

pub enum LinkEvent {
    StartDiscovery,
    Disconnect,
    Shutdown,
    Discovery {
        scan: u64,
        event: DiscoveryEvent,
    },
    ConnectFinished {
        generation: u64,
        device: DeviceDescriptor,
        result: Result<(String, Streams), String>,
    },
    ChannelClosed {
        generation: u64,
    },
}

/// Feeds discovery events into the link manager queue, in order.
///
/// Each sink belongs to one scan; events from a scan that has since been
/// cancelled or replaced are dropped by the manager.
#[derive(Clone)]
pub struct DiscoverySink {
    scan: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl DiscoverySink {
    pub fn emit(&self, event: DiscoveryEvent) {
        let scan = self.scan;
        if self.tx.send(LinkEvent::Discovery { scan, event }).is_err() {
            debug!("Discovery event dropped: link manager stopped");
        }
    }
}

/// Caller-side handle to a running [`LinkManager`]
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl LinkHandle {
    pub fn start_discovery(&self) {
        self.send(LinkEvent::StartDiscovery);
    }

    /// Forget the current connection. The caller shuts down its channel.
    pub fn disconnect(&self) {
        self.send(LinkEvent::Disconnect);
    }

    pub fn shutdown(&self) {
        self.send(LinkEvent::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn send(&self, event: LinkEvent) {
        if self.tx.send(event).is_err() {
            warn!("Link manager is not running");
        }
    }
}

pub struct LinkManager<P: DiscoveryPlatform> {
    state: ConnectionState,
    target: DeviceTarget,
    platform: P,
    strategies: Arc<Vec<Arc<dyn ConnectionStrategy>>>,
    candidate: Option<DeviceDescriptor>,
    scan: u64,
    generation: u64,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
    event_rx: mpsc::UnboundedReceiver<LinkEvent>,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<P: DiscoveryPlatform> LinkManager<P> {
    pub fn new(
        target: DeviceTarget,
        platform: P,
        strategies: Vec<Arc<dyn ConnectionStrategy>>,
        app_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, LinkHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let handle = LinkHandle {
            tx: event_tx.clone(),
            state: state_rx,
        };
        let manager = Self {
            state: ConnectionState::Idle,
            target,
            platform,
            strategies: Arc::new(strategies),
            candidate: None,
            scan: 0,
            generation: 0,
            event_tx,
            event_rx,
            app_tx,
            state_tx,
        };
        (manager, handle)
    }

    /// Process events until [`LinkHandle::shutdown`].
    pub async fn run(mut self) {
        info!(target = %self.target, "Link manager started");
        while let Some(event) = self.event_rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.platform.cancel_discovery();
        info!("Link manager stopped");
    }

    fn handle(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::StartDiscovery => self.start_discovery(),
            LinkEvent::Disconnect => self.disconnect(),
            LinkEvent::Shutdown => return false,
            LinkEvent::Discovery { scan, event } => self.on_discovery(scan, event),
            LinkEvent::ConnectFinished {
                generation,
                device,
                result,
            } => self.on_connect_finished(generation, device, result),
            LinkEvent::ChannelClosed { generation } => self.on_channel_closed(generation),
        }
        true
    }

    fn start_discovery(&mut self) {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
            debug!(state = ?self.state, "Ignoring discovery request");
            return;
        }

        self.candidate = None;
        self.scan += 1;
        let sink = DiscoverySink {
            scan: self.scan,
            tx: self.event_tx.clone(),
        };
        match self.platform.start_discovery(sink) {
            Ok(()) => {
                info!(target = %self.target, "Scanning for turret");
                self.set_state(ConnectionState::Discovering);
            }
            Err(e) => {
                warn!(error = %e, "Failed to start discovery");
                self.set_state(ConnectionState::Failed);
                self.notify(AppEvent::ConnectionFailed(e.to_string()));
            }
        }
    }

    fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Connected => {
                info!("Disconnected from turret");
                self.set_state(ConnectionState::Idle);
            }
            ConnectionState::Discovering => {
                self.platform.cancel_discovery();
                self.candidate = None;
                self.set_state(ConnectionState::Idle);
            }
            state => debug!(state = ?state, "Ignoring disconnect request"),
        }
    }

    fn on_discovery(&mut self, scan: u64, event: DiscoveryEvent) {
        if scan != self.scan {
            debug!(scan, current = self.scan, event = ?event, "Dropping event from an old scan");
            return;
        }
        if self.state != ConnectionState::Discovering {
            debug!(event = ?event, "Discovery event outside discovery");
            return;
        }

        match event {
            DiscoveryEvent::DeviceFound(device) => {
                debug!(device = %device, "Discovered device");
                if self.candidate.is_none() && self.target.matches(&device) {
                    info!(device = %device, "Discovered turret, stopping discovery");
                    self.candidate = Some(device);
                    self.platform.cancel_discovery();
                }
            }
            DiscoveryEvent::ServiceIdsResolved { address, ids } => {
                debug!(address = %address, ids = ?ids, "Service ids resolved");
            }
            DiscoveryEvent::DiscoveryFinished => match self.candidate.take() {
                Some(device) => self.begin_connect(device),
                None => {
                    warn!(target = %self.target, "Turret not found");
                    self.set_state(ConnectionState::Idle);
                    self.notify(AppEvent::DeviceNotFound);
                }
            },
        }
    }

    fn begin_connect(&mut self, device: DeviceDescriptor) {
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        info!(device = %device, "Connecting to turret");

        let generation = self.generation;
        let strategies = self.strategies.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = connect_with_fallback(&strategies, &device).await;
            let _ = tx.send(LinkEvent::ConnectFinished {
                generation,
                device,
                result,
            });
        });
    }

    fn on_connect_finished(
        &mut self,
        generation: u64,
        device: DeviceDescriptor,
        result: Result<(String, Streams), String>,
    ) {
        if self.state != ConnectionState::Connecting || generation != self.generation {
            debug!(generation, "Dropping stale connection result");
            return;
        }

        match result {
            Ok((strategy, streams)) => {
                let mut channel = StreamChannel::new(device, strategy, streams);
                let tx = self.event_tx.clone();
                channel.on_read_closed(move || {
                    let _ = tx.send(LinkEvent::ChannelClosed { generation });
                });
                channel.start_reading();

                info!(
                    device = %channel.device(),
                    strategy = channel.strategy(),
                    "Connected to turret"
                );
                self.set_state(ConnectionState::Connected);
                self.notify(AppEvent::ConnectionEstablished(channel));
            }
            Err(reason) => {
                warn!(device = %device, reason = %reason, "Connection failed");
                self.set_state(ConnectionState::Failed);
                self.notify(AppEvent::ConnectionFailed(reason));
            }
        }
    }

    fn on_channel_closed(&mut self, generation: u64) {
        if self.state == ConnectionState::Connected && generation == self.generation {
            warn!("Turret link lost");
            self.set_state(ConnectionState::Idle);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Link state changed");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn notify(&self, event: AppEvent) {
        if self.app_tx.send(event).is_err() {
            debug!("Caller is gone, dropping notification");
        }
    }
}

/// A handle whose requests go to a plain receiver and whose state is set by
/// the test.
#[cfg(test)]
pub(crate) fn detached_handle() -> (
    LinkHandle,
    mpsc::UnboundedReceiver<LinkEvent>,
    watch::Sender<ConnectionState>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ConnectionState::Idle);
    (LinkHandle { tx, state }, rx, state_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connection::RfcommSocket;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const TURRET: &str = "00:1A:7D:DA:71:13";

    #[derive(Default, Clone)]
    struct FakePlatform {
        started: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
        sinks: Arc<Mutex<Vec<DiscoverySink>>>,
        refuse: bool,
    }

    impl FakePlatform {
        /// Sink handed to the most recent scan
        fn latest_sink(&self) -> DiscoverySink {
            self.sinks
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("discovery was started")
        }
    }

    impl DiscoveryPlatform for FakePlatform {
        fn start_discovery(&mut self, sink: DiscoverySink) -> Result<(), LinkError> {
            if self.refuse {
                return Err(LinkError::Discovery("adapter off".to_string()));
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().unwrap().push(sink);
            Ok(())
        }

        fn cancel_discovery(&mut self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeSocket {
        fail_connect: bool,
        closed: Arc<AtomicUsize>,
        transport: Option<DuplexStream>,
    }

    #[async_trait]
    impl RfcommSocket for FakeSocket {
        async fn connect(&mut self) -> Result<(), LinkError> {
            if self.fail_connect {
                return Err(LinkError::Connect {
                    strategy: "fake".to_string(),
                    reason: "host is down".to_string(),
                });
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), LinkError> {
            self.transport = None;
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn into_streams(self: Box<Self>) -> Streams {
            Streams::split(self.transport.expect("transport present"))
        }
    }

    struct FakeStrategy {
        name: &'static str,
        fail_connect: bool,
        closed: Arc<AtomicUsize>,
        peer: Mutex<Option<DuplexStream>>,
    }

    impl FakeStrategy {
        fn new(name: &'static str, fail_connect: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_connect,
                closed: Arc::new(AtomicUsize::new(0)),
                peer: Mutex::new(None),
            })
        }

        fn take_peer(&self) -> DuplexStream {
            self.peer.lock().unwrap().take().expect("socket was created")
        }
    }

    #[async_trait]
    impl ConnectionStrategy for FakeStrategy {
        fn name(&self) -> &str {
            self.name
        }

        async fn create_socket(
            &self,
            _device: &DeviceDescriptor,
        ) -> Result<Box<dyn RfcommSocket>, LinkError> {
            let (ours, theirs) = duplex(64);
            *self.peer.lock().unwrap() = Some(theirs);
            Ok(Box::new(FakeSocket {
                fail_connect: self.fail_connect,
                closed: self.closed.clone(),
                transport: Some(ours),
            }))
        }
    }

    struct Harness {
        handle: LinkHandle,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
        platform: FakePlatform,
    }

    fn start(platform: FakePlatform, strategies: Vec<Arc<dyn ConnectionStrategy>>) -> Harness {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let target = DeviceTarget {
            address: Some(TURRET.to_string()),
            name: None,
        };
        let (manager, handle) = LinkManager::new(target, platform.clone(), strategies, app_tx);
        tokio::spawn(manager.run());
        Harness {
            handle,
            app_rx,
            platform,
        }
    }

    impl Harness {
        async fn discover(&self, devices: &[DeviceDescriptor]) {
            self.handle.start_discovery();
            self.wait_for_state(ConnectionState::Discovering).await;
            let sink = self.platform.latest_sink();
            for device in devices {
                sink.emit(DiscoveryEvent::DeviceFound(device.clone()));
            }
            sink.emit(DiscoveryEvent::DiscoveryFinished);
        }

        async fn next_event(&mut self) -> AppEvent {
            tokio::time::timeout(Duration::from_secs(1), self.app_rx.recv())
                .await
                .expect("no notification")
                .expect("manager stopped")
        }

        async fn assert_quiet(&mut self) {
            let extra = tokio::time::timeout(Duration::from_millis(50), self.app_rx.recv()).await;
            assert!(extra.is_err(), "unexpected notification: {:?}", extra);
        }

        async fn wait_for_state(&self, state: ConnectionState) {
            let mut rx = self.handle.subscribe();
            tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
                .await
                .expect("state not reached")
                .unwrap();
        }
    }

    fn turret() -> DeviceDescriptor {
        DeviceDescriptor::new("DMG Turret", TURRET.to_lowercase())
    }

    #[tokio::test]
    async fn test_fallback_connects_once() {
        let primary = FakeStrategy::new("primary", true);
        let fallback = FakeStrategy::new("fallback", false);
        let mut harness = start(
            FakePlatform::default(),
            vec![primary.clone(), fallback.clone()],
        );

        harness
            .discover(&[DeviceDescriptor::new("phone", "11:22:33:44:55:66"), turret()])
            .await;

        let mut channel = match harness.next_event().await {
            AppEvent::ConnectionEstablished(channel) => channel,
            other => panic!("expected connection, got {:?}", other),
        };
        assert_eq!(channel.strategy(), "fallback");
        assert_eq!(primary.closed.load(Ordering::SeqCst), 1);
        harness.wait_for_state(ConnectionState::Connected).await;
        harness.assert_quiet().await;

        // the channel talks to the fallback's socket
        let mut peer = fallback.take_peer();
        channel.write(&[5, 3]).await;
        let mut frame = [0u8; 2];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [5, 3]);
    }

    #[tokio::test]
    async fn test_both_strategies_fail() {
        let primary = FakeStrategy::new("primary", true);
        let fallback = FakeStrategy::new("fallback", true);
        let mut harness = start(
            FakePlatform::default(),
            vec![primary.clone(), fallback.clone()],
        );

        harness.discover(&[turret()]).await;

        match harness.next_event().await {
            AppEvent::ConnectionFailed(reason) => assert!(reason.contains("host is down")),
            other => panic!("expected failure, got {:?}", other),
        }
        harness.wait_for_state(ConnectionState::Failed).await;
        harness.assert_quiet().await;
        assert_eq!(primary.closed.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_state_allows_new_discovery() {
        let primary = FakeStrategy::new("primary", true);
        let mut harness = start(FakePlatform::default(), vec![primary]);

        harness.discover(&[turret()]).await;
        assert!(matches!(
            harness.next_event().await,
            AppEvent::ConnectionFailed(_)
        ));
        harness.wait_for_state(ConnectionState::Failed).await;

        harness.handle.start_discovery();
        harness.wait_for_state(ConnectionState::Discovering).await;
        assert_eq!(harness.platform.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_target_not_found() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy]);

        harness
            .discover(&[DeviceDescriptor::new("phone", "11:22:33:44:55:66")])
            .await;

        assert!(matches!(harness.next_event().await, AppEvent::DeviceNotFound));
        harness.wait_for_state(ConnectionState::Idle).await;
        assert_eq!(harness.platform.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discovery_cancelled_when_turret_seen() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy]);

        harness.discover(&[turret(), turret()]).await;

        assert!(matches!(
            harness.next_event().await,
            AppEvent::ConnectionEstablished(_)
        ));
        assert_eq!(harness.platform.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discovery_start_failure() {
        let platform = FakePlatform {
            refuse: true,
            ..Default::default()
        };
        let mut harness = start(platform, Vec::new());

        harness.handle.start_discovery();

        match harness.next_event().await {
            AppEvent::ConnectionFailed(reason) => assert!(reason.contains("adapter off")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(harness.handle.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_dead_channel_reverts_to_idle_silently() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy.clone()]);

        harness.discover(&[turret()]).await;
        let _channel = match harness.next_event().await {
            AppEvent::ConnectionEstablished(channel) => channel,
            other => panic!("expected connection, got {:?}", other),
        };
        harness.wait_for_state(ConnectionState::Connected).await;

        drop(strategy.take_peer());

        harness.wait_for_state(ConnectionState::Idle).await;
        harness.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_disconnect_and_rediscover() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy]);

        harness.discover(&[turret()]).await;
        let mut channel = match harness.next_event().await {
            AppEvent::ConnectionEstablished(channel) => channel,
            other => panic!("expected connection, got {:?}", other),
        };

        // discovery is ignored while connected
        harness.handle.start_discovery();
        harness.handle.disconnect();
        channel.shutdown().await;
        harness.wait_for_state(ConnectionState::Idle).await;
        assert_eq!(harness.platform.started.load(Ordering::SeqCst), 1);

        harness.discover(&[turret()]).await;
        assert!(matches!(
            harness.next_event().await,
            AppEvent::ConnectionEstablished(_)
        ));
        harness.wait_for_state(ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_disconnect_cancels_discovery() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy]);

        harness.handle.start_discovery();
        harness.wait_for_state(ConnectionState::Discovering).await;
        let sink = harness.platform.latest_sink();

        harness.handle.disconnect();
        harness.wait_for_state(ConnectionState::Idle).await;
        assert_eq!(harness.platform.cancelled.load(Ordering::SeqCst), 1);

        // the cancelled scan still reports its end
        sink.emit(DiscoveryEvent::DeviceFound(turret()));
        sink.emit(DiscoveryEvent::DiscoveryFinished);
        harness.assert_quiet().await;
        assert_eq!(harness.handle.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_late_finish_of_cancelled_scan_does_not_end_new_scan() {
        let strategy = FakeStrategy::new("primary", false);
        let mut harness = start(FakePlatform::default(), vec![strategy]);

        harness.handle.start_discovery();
        harness.wait_for_state(ConnectionState::Discovering).await;
        let first = harness.platform.latest_sink();
        harness.handle.disconnect();
        harness.wait_for_state(ConnectionState::Idle).await;

        harness.handle.start_discovery();
        harness.wait_for_state(ConnectionState::Discovering).await;
        let second = harness.platform.latest_sink();
        assert_eq!(harness.platform.started.load(Ordering::SeqCst), 2);

        first.emit(DiscoveryEvent::DiscoveryFinished);
        second.emit(DiscoveryEvent::DeviceFound(turret()));
        second.emit(DiscoveryEvent::DiscoveryFinished);

        match harness.next_event().await {
            AppEvent::ConnectionEstablished(channel) => {
                assert_eq!(channel.device(), &turret())
            }
            other => panic!("expected connection, got {:?}", other),
        }
        harness.wait_for_state(ConnectionState::Connected).await;
    }
}
