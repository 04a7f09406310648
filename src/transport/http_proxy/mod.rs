//! HTTP polling proxy transport
//!
//! Used where a direct broker session is unavailable. The proxy keeps the
//! broker session on its side and exposes the latest payload per topic at a
//! status endpoint; this transport polls it (7 s in the foreground, 20 s in
//! the background), diffs successive snapshots into transport events, and
//! POSTs commands to the publish endpoint.
//!
//! - [`client`] - reqwest calls with the short-TTL status cache
//! - [`poller`] - pure scheduling, diffing and quality bookkeeping

pub mod client;
pub mod poller;

pub use client::{FetchedStatus, ProxyHttpClient};
pub use poller::{PollScheduler, ProxyStats, StatusDiff, FOLLOW_UP_DELAY};

use super::{
    emit, AbortOnDrop, Connector, EventSender, SharedTransport, Transport, TransportEvent,
    TransportId, Visibility,
};
use crate::clock::SharedClock;
use crate::config::ProxySection;
use crate::error::{GateError, GateResult};
use crate::protocol::{Command, ConnectionQuality, TopicSet, TransportKind};
use crate::resilience::{wait_for_shutdown, CircuitBreaker, CircuitBreakerConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Name of the breaker guarding status requests
pub const PROXY_BREAKER_NAME: &str = "http_proxy";

/// State shared between the transport handle and its poll task
#[derive(Debug)]
struct ProxyShared {
    origin: TransportId,
    http: ProxyHttpClient,
    topics: TopicSet,
    events: EventSender,
    breaker: CircuitBreaker,
    clock: SharedClock,
    diff: Mutex<StatusDiff>,
    stats: Mutex<ProxyStats>,
    last_quality: Mutex<Option<ConnectionQuality>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ProxyShared {
    async fn fetch(&self, use_cache: bool) -> GateResult<FetchedStatus> {
        self.breaker
            .execute(|| self.http.fetch_status(use_cache))
            .await
    }

    /// Fold a successful fetch into stats and emit what changed
    fn absorb(&self, fetched: FetchedStatus) {
        if let Some(elapsed) = fetched.elapsed {
            lock(&self.stats).record_success(elapsed, self.clock.wall());
        }
        let events = lock(&self.diff).apply(&fetched.response, &self.topics);
        if !events.is_empty() {
            debug!(transport = %self.origin, changes = events.len(), "Proxy status changed");
        }
        for event in events {
            emit(&self.events, self.origin, event);
        }
        self.report_quality();
    }

    fn absorb_failure(&self, err: &GateError) {
        // A rejected call never reached the proxy
        if !err.is_circuit_open() {
            lock(&self.stats).record_failure(self.clock.wall());
        }
        warn!(transport = %self.origin, error = %err, "Proxy poll failed");
        let offline = lock(&self.diff).mark_unreachable(&err.user_message());
        if let Some(event) = offline {
            emit(&self.events, self.origin, event);
        }
        self.report_quality();
    }

    fn report_quality(&self) {
        let quality = lock(&self.stats).quality();
        let mut last = lock(&self.last_quality);
        if *last != Some(quality) {
            *last = Some(quality);
            emit(&self.events, self.origin, TransportEvent::Quality(quality));
        }
    }

    async fn poll_once(self: Arc<Self>, use_cache: bool) {
        match self.fetch(use_cache).await {
            Ok(fetched) => self.absorb(fetched),
            Err(err) => self.absorb_failure(&err),
        }
    }
}

type InFlightPoll = Pin<Box<dyn Future<Output = ()> + Send>>;

async fn drive(poll: &mut Option<InFlightPoll>) {
    match poll {
        Some(poll) => poll.await,
        None => std::future::pending().await,
    }
}

/// Poll loop: regular ticks, manual refreshes and visibility changes, with at
/// most one request in flight
async fn run_poller(
    shared: Arc<ProxyShared>,
    mut scheduler: PollScheduler,
    mut shutdown_rx: watch::Receiver<bool>,
    mut visibility_rx: watch::Receiver<Visibility>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
) {
    let sleep = tokio::time::sleep(scheduler.interval());
    tokio::pin!(sleep);
    let mut in_flight: Option<InFlightPoll> = None;

    loop {
        // (use_cache) of a poll requested by this iteration
        let requested: Option<bool> = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = drive(&mut in_flight) => {
                in_flight = None;
                let delay = scheduler.finish_poll();
                sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                None
            }
            _ = &mut sleep => {
                // A tick during a slow poll is owed as a follow-up
                sleep.as_mut().reset(tokio::time::Instant::now() + scheduler.interval());
                Some(false)
            }
            refresh = refresh_rx.recv() => match refresh {
                Some(()) => Some(true),
                None => break,
            },
            changed = visibility_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let visibility = *visibility_rx.borrow_and_update();
                let delay = scheduler.set_visibility(visibility);
                debug!(transport = %shared.origin, ?visibility, "Poll cadence changed");
                if scheduler.is_polling() {
                    // Owe an immediate follow-up when coming to the foreground
                    if delay.is_zero() {
                        scheduler.begin_poll();
                    }
                } else {
                    sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                }
                None
            }
        };

        if let Some(use_cache) = requested {
            if scheduler.begin_poll() {
                in_flight = Some(Box::pin(shared.clone().poll_once(use_cache)));
            } else {
                debug!(transport = %shared.origin, "Poll already in flight, coalescing");
            }
        }
    }
    debug!(transport = %shared.origin, "Proxy poller stopped");
}

#[derive(Debug)]
pub struct HttpProxyTransport {
    id: TransportId,
    endpoint: String,
    shared: Arc<ProxyShared>,
    shutdown_tx: watch::Sender<bool>,
    visibility_tx: watch::Sender<Visibility>,
    refresh_tx: mpsc::UnboundedSender<()>,
    poller: Mutex<Option<AbortOnDrop>>,
    closed: AtomicBool,
}

impl HttpProxyTransport {
    /// Fetch the proxy status once (uncached) and start polling. The fetch
    /// doubles as the diff baseline, so every payload it carries is emitted.
    pub async fn connect(
        id: TransportId,
        config: &ProxySection,
        topics: TopicSet,
        events: EventSender,
        breaker: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> GateResult<Self> {
        let http = ProxyHttpClient::new(config)?;
        let endpoint = http.base_url().to_string();
        let shared = Arc::new(ProxyShared {
            origin: id,
            http,
            topics,
            events,
            breaker: CircuitBreaker::new(PROXY_BREAKER_NAME, breaker, clock.clone()),
            clock,
            diff: Mutex::new(StatusDiff::new()),
            stats: Mutex::new(ProxyStats::default()),
            last_quality: Mutex::new(None),
        });

        info!(transport = %id, endpoint = %endpoint, "Connecting via HTTP proxy");
        let baseline = match shared.fetch(false).await {
            Ok(fetched) => fetched,
            Err(err) => {
                lock(&shared.stats).record_failure(shared.clock.wall());
                return Err(err);
            }
        };
        shared.absorb(baseline);

        let scheduler = PollScheduler::new(
            Duration::from_millis(config.foreground_interval_ms),
            Duration::from_millis(config.background_interval_ms),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (visibility_tx, visibility_rx) = watch::channel(Visibility::Foreground);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(run_poller(
            shared.clone(),
            scheduler,
            shutdown_rx,
            visibility_rx,
            refresh_rx,
        ));
        info!(transport = %id, endpoint = %endpoint, "HTTP proxy polling started");

        Ok(Self {
            id,
            endpoint,
            shared,
            shutdown_tx,
            visibility_tx,
            refresh_tx,
            poller: Mutex::new(Some(AbortOnDrop(poller))),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> ProxyStats {
        lock(&self.shared.stats).clone()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }
}

#[async_trait::async_trait]
impl Transport for HttpProxyTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::HttpProxy
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && lock(&self.shared.diff).is_connected()
    }

    async fn publish_command(&self, command: &Command) -> GateResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GateError::NotConnected);
        }

        let request = command.to_proxy_request(&self.shared.topics.command);
        let result = self.shared.http.publish(&request).await;
        match &result {
            Ok(elapsed) => {
                lock(&self.shared.stats).record_success(*elapsed, self.shared.clock.wall());
                debug!(transport = %self.id, command = %command.kind, actor = %command.actor, "Command posted to proxy");
            }
            Err(err) => {
                lock(&self.shared.stats).record_failure(self.shared.clock.wall());
                warn!(transport = %self.id, error = %err, "Proxy publish failed");
            }
        }
        self.shared.report_quality();
        result.map(|_| ())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        lock(&self.poller).take();
        self.shared.http.clear_cache();
        info!(transport = %self.id, endpoint = %self.endpoint, "HTTP proxy transport shut down");
    }

    fn set_visibility(&self, visibility: Visibility) {
        self.visibility_tx.send_if_modified(|current| {
            let changed = *current != visibility;
            *current = visibility;
            changed
        });
    }

    fn request_refresh(&self) {
        let _ = self.refresh_tx.send(());
    }
}

/// Connects [`HttpProxyTransport`]s to the configured proxy
#[derive(Debug, Clone)]
pub struct HttpProxyConnector {
    config: ProxySection,
    topics: TopicSet,
    breaker: CircuitBreakerConfig,
    clock: SharedClock,
}

impl HttpProxyConnector {
    pub fn new(
        config: ProxySection,
        topics: TopicSet,
        breaker: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            topics,
            breaker,
            clock,
        }
    }
}

#[async_trait::async_trait]
impl Connector for HttpProxyConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpProxy
    }

    fn endpoint(&self) -> String {
        self.config
            .base_url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string()
    }

    async fn connect(&self, id: TransportId, events: EventSender) -> GateResult<SharedTransport> {
        let transport = HttpProxyTransport::connect(
            id,
            &self.config,
            self.topics.clone(),
            events,
            self.breaker,
            self.clock.clone(),
        )
        .await?;
        Ok(Arc::new(transport))
    }
}
