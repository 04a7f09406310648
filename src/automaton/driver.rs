//! Async driver for the gate automaton
//!
//! A single task owns the [`AutomatonCore`] and feeds it status changes, the
//! one-second tick, the 500 ms confirmation probe, issued commands, sync
//! updates from other instances and the outcome of automatic republishes.

use super::settings::SettingsSource;
use super::state::{
    AutomatonCore, GateAutomationState, Notice, Republish, Step, PROBE_INTERVAL, TICK_INTERVAL,
};
use super::sync::{SyncStore, SyncUpdate, SyncVersion, SYNC_KEY};
use crate::clock::SharedClock;
use crate::error::GateResult;
use crate::messaging::{ListenerId, Listeners, MessagingClient};
use crate::protocol::{CommandKind, DeviceStatus, GateState};
use crate::resilience::retry::wait_for_shutdown;
use crate::transport::AbortOnDrop;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sends gate commands on behalf of the automaton
#[async_trait]
pub trait CommandPublisher: Send + Sync + Debug {
    async fn publish(&self, kind: CommandKind, actor: &str) -> GateResult<()>;
}

#[async_trait]
impl CommandPublisher for MessagingClient {
    async fn publish(&self, kind: CommandKind, actor: &str) -> GateResult<()> {
        self.publish_command(kind, actor).await
    }
}

#[derive(Debug)]
enum Request {
    CommandIssued {
        kind: CommandKind,
        actor: String,
        gate: GateState,
    },
}

type RepublishFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Handle to a running automaton; clones share the same task
#[derive(Debug, Clone)]
pub struct GateAutomaton {
    inner: Arc<AutomatonInner>,
}

#[derive(Debug)]
struct AutomatonInner {
    origin: Uuid,
    publisher: Arc<dyn CommandPublisher>,
    status: watch::Receiver<DeviceStatus>,
    state_rx: watch::Receiver<GateAutomationState>,
    notices: Arc<Listeners<Notice>>,
    requests: mpsc::UnboundedSender<Request>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<AbortOnDrop>>,
}

impl GateAutomaton {
    /// Restore the shared state, look at the current gate state and start
    /// the driver task
    pub async fn start(
        status: watch::Receiver<DeviceStatus>,
        publisher: Arc<dyn CommandPublisher>,
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn SyncStore>,
        clock: SharedClock,
    ) -> Self {
        let origin = Uuid::new_v4();
        let mut core = AutomatonCore::new();
        let thresholds = settings.read();
        let mut last_sync = None;

        match store.get(SYNC_KEY).await {
            Ok(Some(snapshot)) => {
                core.restore(&snapshot, clock.wall(), &thresholds);
                last_sync = Some(snapshot.version());
                debug!(phase = %core.phase(), "Restored shared automaton state");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read shared automaton state"),
        }

        let (state_tx, state_rx) = watch::channel(core.state().clone());
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notices = Arc::new(Listeners::new("automaton_notices"));
        let sync_rx = store.subscribe();

        let mut driver = Driver {
            origin,
            core,
            status: status.clone(),
            requests: requests_rx,
            sync_rx,
            sync_open: true,
            last_sync,
            shutdown_rx,
            publisher: Arc::clone(&publisher),
            settings,
            store,
            clock,
            state_tx,
            notices: Arc::clone(&notices),
            tick: periodic(TICK_INTERVAL),
            probe: periodic(PROBE_INTERVAL),
        };

        let gate = driver.status.borrow_and_update().gate_state;
        let step = driver.core.observe(gate, driver.clock.wall(), &thresholds);
        driver.apply(step, true).await;

        info!(origin = %origin, phase = %driver.core.phase(), "Gate automaton started");
        let task = tokio::spawn(driver.run());

        Self {
            inner: Arc::new(AutomatonInner {
                origin,
                publisher,
                status,
                state_rx,
                notices,
                requests,
                shutdown_tx,
                task: Mutex::new(Some(AbortOnDrop(task))),
            }),
        }
    }

    /// Identity written into shared snapshots
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    /// Publish a user command. A toggle sent while the gate is closed is
    /// watched until the gate starts opening.
    pub async fn issue_command(&self, kind: CommandKind, actor: &str) -> GateResult<()> {
        let gate = self.inner.status.borrow().gate_state;
        self.inner.publisher.publish(kind, actor).await?;

        let _ = self.inner.requests.send(Request::CommandIssued {
            kind,
            actor: actor.to_string(),
            gate,
        });
        Ok(())
    }

    pub fn state(&self) -> GateAutomationState {
        self.inner.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateAutomationState> {
        self.inner.state_rx.clone()
    }

    pub fn on_notice<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Notice) + Send + Sync + 'static,
    {
        self.inner.notices.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.notices.unsubscribe(id)
    }

    /// Stop the driver task; the last state stays readable
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(task);
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Driver {
    origin: Uuid,
    core: AutomatonCore,
    status: watch::Receiver<DeviceStatus>,
    requests: mpsc::UnboundedReceiver<Request>,
    sync_rx: broadcast::Receiver<SyncUpdate>,
    sync_open: bool,
    /// Newest snapshot this instance wrote or adopted
    last_sync: Option<SyncVersion>,
    shutdown_rx: watch::Receiver<bool>,
    publisher: Arc<dyn CommandPublisher>,
    settings: Arc<dyn SettingsSource>,
    store: Arc<dyn SyncStore>,
    clock: SharedClock,
    state_tx: watch::Sender<GateAutomationState>,
    notices: Arc<Listeners<Notice>>,
    tick: Interval,
    probe: Interval,
}

impl Driver {
    async fn run(mut self) {
        let mut republish: Option<RepublishFuture> = None;

        loop {
            let probing = self.core.is_probing();
            let republishing = republish.is_some();

            let (step, persist) = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown_rx) => break,

                changed = self.status.changed() => {
                    if changed.is_err() {
                        debug!("Status source closed, stopping automaton");
                        break;
                    }
                    let gate = self.status.borrow_and_update().gate_state;
                    if gate == self.core.last_gate() {
                        continue;
                    }
                    (self.core.observe(gate, self.clock.wall(), &self.settings.read()), true)
                }

                _ = self.tick.tick() => (self.core.tick(), true),

                _ = self.probe.tick(), if probing => (self.core.probe(), true),

                Some(request) = self.requests.recv() => {
                    let Request::CommandIssued { kind, actor, gate } = request;
                    (self.core.command_issued(kind, &actor, gate, &self.settings.read()), true)
                }

                update = self.sync_rx.recv(), if self.sync_open => match update {
                    Ok(update)
                        if update.key == SYNC_KEY
                            && update.snapshot.origin != self.origin
                            && update.snapshot.supersedes(self.last_sync) =>
                    {
                        self.last_sync = Some(update.snapshot.version());
                        let now = self.clock.wall();
                        (self.core.restore(&update.snapshot, now, &self.settings.read()), false)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync updates lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.sync_open = false;
                        continue;
                    }
                },

                result = async {
                    match republish.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if republishing => {
                    republish = None;
                    (self.core.republish_finished(result, &self.settings.read()), true)
                }
            };

            if let Some(next) = self.apply(step, persist).await {
                republish = Some(next);
            }
        }
        debug!(origin = %self.origin, "Gate automaton stopped");
    }

    /// Publish the step's effects; returns the republish to drive, if any
    async fn apply(&mut self, step: Step, persist: bool) -> Option<RepublishFuture> {
        for notice in &step.notices {
            info!(notice = %notice, "Gate automaton notice");
            self.notices.notify(notice);
        }

        let state = self.core.state().clone();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        if step.timers_restarted {
            self.tick.reset();
            self.probe.reset();
        }

        if persist && step.phase_changed {
            // Own writes must outrank everything already seen here
            let mut stamp = self.clock.wall();
            if let Some((seen, _)) = self.last_sync {
                stamp = stamp.max(seen + chrono::Duration::milliseconds(1));
            }
            let snapshot = self.core.snapshot(self.origin, stamp);
            self.last_sync = Some(snapshot.version());
            if let Err(e) = self.store.set(SYNC_KEY, &snapshot).await {
                warn!(error = %e, "Failed to persist automaton state");
            }
        }

        step.republish.map(|republish| self.start_republish(republish))
    }

    fn start_republish(&self, Republish { kind, actor }: Republish) -> RepublishFuture {
        let publisher = Arc::clone(&self.publisher);
        let limit_s = self.settings.read().retry_time_limit_s;

        Box::pin(async move {
            let limit = Duration::from_secs(u64::from(limit_s));
            match tokio::time::timeout(limit, publisher.publish(kind, &actor)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.user_message()),
                Err(_) => Err(format!("vypršel časový limit {limit_s}s")),
            }
        })
    }
}
