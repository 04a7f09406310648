//! Gate automaton driven by a real messaging client over mock transports
//!
//! Time is paused, so the countdown and confirmation windows run instantly.


use gatelink::automaton::{
    AutomatonPhase, GateAutomaton, MemorySyncStore, Notice, SyncStore, Thresholds, WatchSettings,
};
use gatelink::clock::TokioClock;
use gatelink::error::GateError;
use gatelink::messaging::MessagingClient;
use gatelink::protocol::{CommandKind, DeviceStatus, TransportKind};
use gatelink::testing::{MockConnector, RecordingPublisher};
use gatelink::transport::Connector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::*;
use tokio::sync::watch;

struct Rig {
    client: MessagingClient,
    connector: Arc<MockConnector>,
    automaton: GateAutomaton,
    notices: Arc<Mutex<Vec<Notice>>>,
}

async fn start_automaton(
    status: watch::Receiver<DeviceStatus>,
    publisher: Arc<dyn gatelink::automaton::CommandPublisher>,
    store: Arc<dyn SyncStore>,
) -> (GateAutomaton, Arc<Mutex<Vec<Notice>>>) {
    let automaton = GateAutomaton::start(
        status,
        publisher,
        Arc::new(WatchSettings::new(Thresholds::default())),
        store,
        Arc::new(TokioClock),
    )
    .await;
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    automaton.on_notice(move |notice| sink.lock().unwrap().push(notice.clone()));
    (automaton, notices)
}

async fn rig_with_store(store: Arc<dyn SyncStore>, connect: bool) -> Rig {
    let connector = Arc::new(MockConnector::new(TransportKind::Direct, "mock://broker"));
    let client = client_with(&broker_config(), vec![connector.clone() as Arc<dyn Connector>]);
    if connect {
        client.connect().await.unwrap();
    }
    let (automaton, notices) =
        start_automaton(client.subscribe_status(), Arc::new(client.clone()), store).await;
    Rig {
        client,
        connector,
        automaton,
        notices,
    }
}

async fn rig() -> Rig {
    rig_with_store(Arc::new(MemorySyncStore::new()), true).await
}

impl Rig {
    fn gate(&self, payload: &str) {
        self.connector.last().unwrap().emit_message(GATE_TOPIC, payload);
    }

    fn published(&self) -> usize {
        self.connector.last().unwrap().published().len()
    }

    async fn wait_for_phase(&self, phase: AutomatonPhase) -> bool {
        wait_until(Duration::from_secs(2), || self.automaton.state().phase == phase).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_gate_starts_countdown() {
    let rig = rig().await;
    rig.gate("P2");

    assert!(rig.wait_for_phase(AutomatonPhase::AutoCloseCountdown).await);
    let state = rig.automaton.state();
    assert!(state.opened_at.is_some());
    assert!(state.auto_close_remaining_s >= 248);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let remaining = rig.automaton.state().auto_close_remaining_s;
    assert!((238..=241).contains(&remaining), "remaining {remaining}");
}

#[tokio::test(start_paused = true)]
async fn test_closing_gate_returns_to_idle() {
    let rig = rig().await;
    rig.gate("P2");
    assert!(rig.wait_for_phase(AutomatonPhase::AutoCloseCountdown).await);

    rig.gate("P4");
    assert!(rig.wait_for_phase(AutomatonPhase::Idle).await);
    assert_eq!(rig.automaton.state().opened_at, None);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_toggle_is_republished_through_client() {
    let rig = rig().await;
    rig.gate("P1");
    assert!(
        wait_until(Duration::from_secs(1), || {
            rig.client.get_status().gate_state == gatelink::GateState::Closed
        })
        .await
    );

    rig.automaton
        .issue_command(CommandKind::Toggle, "Anna")
        .await
        .unwrap();
    assert!(rig.wait_for_phase(AutomatonPhase::AwaitingOpenConfirmation).await);
    assert_eq!(rig.published(), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(rig.published(), 2);
    let published = rig.connector.last().unwrap().published();
    assert!(published.iter().all(|c| c.kind == CommandKind::Toggle));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(rig.published(), 2);
    assert_eq!(rig.automaton.state().phase, AutomatonPhase::Idle);
    assert!(rig.notices.lock().unwrap().contains(&Notice::OpenNotConfirmed));
}

#[tokio::test(start_paused = true)]
async fn test_opening_report_confirms_toggle() {
    let rig = rig().await;
    rig.gate("P1");
    assert!(
        wait_until(Duration::from_secs(1), || {
            rig.client.get_status().gate_state == gatelink::GateState::Closed
        })
        .await
    );

    rig.automaton
        .issue_command(CommandKind::Toggle, "Anna")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    rig.gate("P3");

    assert!(rig.wait_for_phase(AutomatonPhase::Idle).await);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(rig.published(), 1);
    assert!(rig.notices.lock().unwrap().contains(&Notice::OpeningConfirmed));
}

#[tokio::test(start_paused = true)]
async fn test_command_fails_while_disconnected() {
    let rig = rig_with_store(Arc::new(MemorySyncStore::new()), false).await;

    let err = rig
        .automaton
        .issue_command(CommandKind::Toggle, "Anna")
        .await
        .unwrap_err();

    assert!(matches!(err, GateError::NotConnected));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.automaton.state().phase, AutomatonPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_instance_follows_shared_state() {
    let store = Arc::new(MemorySyncStore::new());
    let rig = rig_with_store(store.clone(), true).await;

    let (_status_tx, status_rx) = watch::channel(DeviceStatus::disconnected());
    let (follower, _notices) =
        start_automaton(status_rx, Arc::new(RecordingPublisher::new()), store.clone()).await;
    assert_ne!(follower.origin(), rig.automaton.origin());

    rig.gate("P2");
    assert!(
        wait_until(Duration::from_secs(2), || {
            follower.state().phase == AutomatonPhase::AutoCloseCountdown
        })
        .await
    );
    assert_eq!(follower.state().opened_at, rig.automaton.state().opened_at);

    rig.gate("P1");
    assert!(
        wait_until(Duration::from_secs(2), || {
            follower.state().phase == AutomatonPhase::Idle
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_instance_restores_countdown() {
    let store = Arc::new(MemorySyncStore::new());
    let rig = rig_with_store(store.clone(), true).await;
    rig.gate("P2");
    assert!(rig.wait_for_phase(AutomatonPhase::AutoCloseCountdown).await);
    let mut persisted = false;
    for _ in 0..100 {
        if let Ok(Some(snapshot)) = store.get(gatelink::automaton::SYNC_KEY).await {
            persisted = snapshot.phase == AutomatonPhase::AutoCloseCountdown;
            if persisted {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted);

    let (_status_tx, status_rx) = watch::channel(DeviceStatus::disconnected());
    let (late, _notices) =
        start_automaton(status_rx, Arc::new(RecordingPublisher::new()), store).await;

    assert_eq!(late.state().phase, AutomatonPhase::AutoCloseCountdown);
    assert!(late.state().auto_close_remaining_s <= 250);
}
