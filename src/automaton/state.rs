//! Pure gate timing automaton
//!
//! [`AutomatonCore`] holds no timers and performs no I/O. The driver feeds it
//! status observations, one-second ticks, 500 ms probes and republish results;
//! each input returns a [`Step`] describing what the driver must do next.

use super::settings::Thresholds;
use super::sync::SyncSnapshot;
use crate::protocol::{CommandKind, GateState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Countdown resolution
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Resolution of the open-confirmation probe
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);
/// The user command plus one automatic republish
pub const MAX_CONFIRMATION_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutomatonPhase {
    #[default]
    Idle,
    AutoCloseCountdown,
    OpenDurationDisplay,
    AwaitingOpenConfirmation,
}

impl fmt::Display for AutomatonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AutomatonPhase::Idle => "idle",
            AutomatonPhase::AutoCloseCountdown => "auto_close_countdown",
            AutomatonPhase::OpenDurationDisplay => "open_duration_display",
            AutomatonPhase::AwaitingOpenConfirmation => "awaiting_open_confirmation",
        };
        f.write_str(name)
    }
}

/// UI-facing automaton state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GateAutomationState {
    pub phase: AutomatonPhase,
    pub opened_at: Option<DateTime<Utc>>,
    pub auto_close_remaining_s: u32,
    pub open_duration_elapsed_s: u64,
    pub confirmation_remaining_s: u32,
}

/// Messages for the user about the command being watched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CommandSent,
    WatchingForOpening { attempt: u32 },
    OpeningConfirmed,
    RetryingCommand,
    RetryFailed { reason: String },
    OpenNotConfirmed,
    ConfirmationCancelled,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::CommandSent => f.write_str("Příkaz odeslán"),
            Notice::WatchingForOpening { attempt: 1 } => f.write_str("Hlídám otevření brány..."),
            Notice::WatchingForOpening { .. } => {
                f.write_str("Hlídám otevření brány (druhý pokus)...")
            }
            Notice::OpeningConfirmed => f.write_str("Brána se otevírá..."),
            Notice::RetryingCommand => f.write_str("Provádím druhý pokus o otevření..."),
            Notice::RetryFailed { reason } => write!(f, "Chyba při druhém pokusu: {reason}"),
            Notice::OpenNotConfirmed => f.write_str("Brána se neotevřela ani po druhém pokusu"),
            Notice::ConfirmationCancelled => {
                f.write_str("Brána se zavírá - kontrola otevření zastavena")
            }
        }
    }
}

/// Command the driver must publish again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Republish {
    pub kind: CommandKind,
    pub actor: String,
}

/// Outcome of one automaton input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub notices: Vec<Notice>,
    pub republish: Option<Republish>,
    pub phase_changed: bool,
    /// A countdown or confirmation window started; timers restart from now
    pub timers_restarted: bool,
}

#[derive(Debug, Clone)]
struct Confirmation {
    kind: CommandKind,
    actor: String,
    attempt: u32,
    probes_left: u32,
    republishing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AutomatonCore {
    state: GateAutomationState,
    confirmation: Option<Confirmation>,
    last_gate: GateState,
}

impl AutomatonCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateAutomationState {
        &self.state
    }

    pub fn phase(&self) -> AutomatonPhase {
        self.state.phase
    }

    pub fn last_gate(&self) -> GateState {
        self.last_gate
    }

    /// Whether the 500 ms probe should run
    pub fn is_probing(&self) -> bool {
        self.confirmation.as_ref().is_some_and(|c| !c.republishing)
    }

    /// Whether a republish is out and its result is awaited
    pub fn is_republishing(&self) -> bool {
        self.confirmation.as_ref().is_some_and(|c| c.republishing)
    }

    fn transition(&mut self, step: &mut Step, to: AutomatonPhase) {
        if self.state.phase != to {
            info!(from = %self.state.phase, to = %to, "Gate automaton transition");
            self.state.phase = to;
            step.phase_changed = true;
        }
    }

    fn to_idle(&mut self, step: &mut Step) {
        self.confirmation = None;
        self.state.opened_at = None;
        self.state.auto_close_remaining_s = 0;
        self.state.open_duration_elapsed_s = 0;
        self.state.confirmation_remaining_s = 0;
        self.transition(step, AutomatonPhase::Idle);
    }

    fn start_countdown(&mut self, step: &mut Step, opened_at: DateTime<Utc>, remaining_s: u32) {
        self.confirmation = None;
        self.state.opened_at = Some(opened_at);
        self.state.auto_close_remaining_s = remaining_s;
        self.state.open_duration_elapsed_s = 0;
        self.state.confirmation_remaining_s = 0;
        self.transition(step, AutomatonPhase::AutoCloseCountdown);
        step.timers_restarted = true;
    }

    fn show_open_duration(&mut self, step: &mut Step, elapsed_s: u64) {
        self.state.auto_close_remaining_s = 0;
        self.state.open_duration_elapsed_s = elapsed_s;
        self.transition(step, AutomatonPhase::OpenDurationDisplay);
    }

    fn open_window(&mut self, step: &mut Step, limit_s: u32) {
        let Some(confirmation) = self.confirmation.as_mut() else {
            return;
        };
        confirmation.probes_left = limit_s.saturating_mul(2).max(1);
        confirmation.republishing = false;
        let attempt = confirmation.attempt;
        self.state.confirmation_remaining_s = limit_s;
        self.transition(step, AutomatonPhase::AwaitingOpenConfirmation);
        step.timers_restarted = true;
        step.notices.push(Notice::WatchingForOpening { attempt });
    }

    /// The gate state changed
    pub fn observe(&mut self, gate: GateState, now: DateTime<Utc>, thresholds: &Thresholds) -> Step {
        let mut step = Step::default();
        self.last_gate = gate;

        match (gate, self.state.phase) {
            (GateState::Closing, AutomatonPhase::Idle) => {}
            (GateState::Closing, phase) => {
                if phase == AutomatonPhase::AwaitingOpenConfirmation {
                    step.notices.push(Notice::ConfirmationCancelled);
                }
                self.to_idle(&mut step);
            }
            (
                GateState::Closed,
                AutomatonPhase::AutoCloseCountdown | AutomatonPhase::OpenDurationDisplay,
            ) => self.to_idle(&mut step),
            (GateState::Open, AutomatonPhase::Idle) => {
                self.start_countdown(&mut step, now, thresholds.auto_close_time_limit_s);
            }
            (GateState::Open, AutomatonPhase::AwaitingOpenConfirmation) => {
                step.notices.push(Notice::OpeningConfirmed);
                self.start_countdown(&mut step, now, thresholds.auto_close_time_limit_s);
            }
            (GateState::Opening, AutomatonPhase::AwaitingOpenConfirmation) => {
                step.notices.push(Notice::OpeningConfirmed);
                self.to_idle(&mut step);
            }
            _ => {}
        }
        step
    }

    /// One second passed
    pub fn tick(&mut self) -> Step {
        let mut step = Step::default();
        match self.state.phase {
            AutomatonPhase::AutoCloseCountdown => {
                self.state.auto_close_remaining_s = self.state.auto_close_remaining_s.saturating_sub(1);
                if self.state.auto_close_remaining_s == 0 {
                    self.show_open_duration(&mut step, 0);
                }
            }
            AutomatonPhase::OpenDurationDisplay => {
                self.state.open_duration_elapsed_s += 1;
            }
            AutomatonPhase::AwaitingOpenConfirmation => {
                self.state.confirmation_remaining_s =
                    self.state.confirmation_remaining_s.saturating_sub(1);
            }
            AutomatonPhase::Idle => {}
        }
        step
    }

    /// 500 ms passed in a confirmation window
    pub fn probe(&mut self) -> Step {
        let mut step = Step::default();
        if !self.is_probing() {
            return step;
        }
        if self.last_gate == GateState::Opening {
            step.notices.push(Notice::OpeningConfirmed);
            self.to_idle(&mut step);
            return step;
        }

        let Some(confirmation) = self.confirmation.as_mut() else {
            return step;
        };
        confirmation.probes_left = confirmation.probes_left.saturating_sub(1);
        if confirmation.probes_left > 0 {
            return step;
        }

        if confirmation.attempt < MAX_CONFIRMATION_ATTEMPTS {
            confirmation.republishing = true;
            step.republish = Some(Republish {
                kind: confirmation.kind,
                actor: confirmation.actor.clone(),
            });
            self.state.confirmation_remaining_s = 0;
            step.notices.push(Notice::RetryingCommand);
        } else {
            step.notices.push(Notice::OpenNotConfirmed);
            self.to_idle(&mut step);
        }
        step
    }

    /// A user command was published. `gate` is the gate state when it was
    /// issued; only a toggle sent at a closed gate is watched.
    pub fn command_issued(
        &mut self,
        kind: CommandKind,
        actor: &str,
        gate: GateState,
        thresholds: &Thresholds,
    ) -> Step {
        let mut step = Step {
            notices: vec![Notice::CommandSent],
            ..Step::default()
        };
        if kind != CommandKind::Toggle
            || gate != GateState::Closed
            || self.state.phase != AutomatonPhase::Idle
        {
            return step;
        }

        self.confirmation = Some(Confirmation {
            kind,
            actor: actor.to_string(),
            attempt: 1,
            probes_left: 0,
            republishing: false,
        });
        self.open_window(&mut step, thresholds.open_check_time_limit_s);
        step
    }

    /// The automatic republish finished (or gave up)
    pub fn republish_finished(&mut self, result: Result<(), String>, thresholds: &Thresholds) -> Step {
        let mut step = Step::default();
        if !self.is_republishing() {
            return step;
        }
        match result {
            Ok(()) => {
                if let Some(confirmation) = self.confirmation.as_mut() {
                    confirmation.attempt += 1;
                }
                self.open_window(&mut step, thresholds.open_check_time_limit_s);
            }
            Err(reason) => {
                step.notices.push(Notice::RetryFailed { reason });
                self.to_idle(&mut step);
            }
        }
        step
    }

    /// Adopt a persisted or broadcast snapshot. Countdown phases are rebuilt
    /// from `opened_at`, so instances converge on the same remaining time.
    /// A confirmation in progress here is local and takes precedence.
    pub fn restore(&mut self, snapshot: &SyncSnapshot, now: DateTime<Utc>, thresholds: &Thresholds) -> Step {
        let mut step = Step::default();
        if self.confirmation.is_some() {
            return step;
        }

        match (snapshot.phase, snapshot.opened_at) {
            (
                AutomatonPhase::AutoCloseCountdown | AutomatonPhase::OpenDurationDisplay,
                Some(opened_at),
            ) => {
                let elapsed = (now - opened_at).num_seconds().max(0) as u64;
                let limit = u64::from(thresholds.auto_close_time_limit_s);
                if elapsed < limit {
                    self.start_countdown(&mut step, opened_at, (limit - elapsed) as u32);
                } else {
                    self.state.opened_at = Some(opened_at);
                    self.show_open_duration(&mut step, elapsed - limit);
                }
            }
            (AutomatonPhase::Idle, _)
                if matches!(
                    self.state.phase,
                    AutomatonPhase::AutoCloseCountdown | AutomatonPhase::OpenDurationDisplay
                ) =>
            {
                self.to_idle(&mut step);
            }
            _ => {}
        }
        step
    }

    pub fn snapshot(&self, origin: Uuid, now: DateTime<Utc>) -> SyncSnapshot {
        SyncSnapshot {
            origin,
            phase: self.state.phase,
            opened_at: self.state.opened_at,
            auto_close_remaining_s: self.state.auto_close_remaining_s,
            open_duration_elapsed_s: self.state.open_duration_elapsed_s,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(auto_close: u32, open_check: u32) -> Thresholds {
        Thresholds {
            auto_close_time_limit_s: auto_close,
            retry_time_limit_s: 3,
            open_check_time_limit_s: open_check,
        }
    }

    fn opened_core(limit: u32) -> AutomatonCore {
        let mut core = AutomatonCore::new();
        core.observe(GateState::Closed, Utc::now(), &thresholds(limit, 10));
        core.observe(GateState::Open, Utc::now(), &thresholds(limit, 10));
        core
    }

    fn probe_n(core: &mut AutomatonCore, n: usize) -> Vec<Step> {
        (0..n).map(|_| core.probe()).collect()
    }

    #[test]
    fn test_open_starts_countdown() {
        let now = Utc::now();
        let mut core = AutomatonCore::new();
        let step = core.observe(GateState::Open, now, &thresholds(250, 10));

        assert!(step.phase_changed);
        assert!(step.timers_restarted);
        assert_eq!(core.phase(), AutomatonPhase::AutoCloseCountdown);
        assert_eq!(core.state().opened_at, Some(now));
        assert_eq!(core.state().auto_close_remaining_s, 250);
    }

    #[test]
    fn test_countdown_then_open_duration() {
        let mut core = opened_core(250);

        for _ in 0..249 {
            core.tick();
        }
        assert_eq!(core.state().auto_close_remaining_s, 1);
        assert_eq!(core.phase(), AutomatonPhase::AutoCloseCountdown);

        let step = core.tick();
        assert!(step.phase_changed);
        assert_eq!(core.phase(), AutomatonPhase::OpenDurationDisplay);
        assert_eq!(core.state().open_duration_elapsed_s, 0);

        for _ in 0..10 {
            core.tick();
        }
        assert_eq!(core.state().open_duration_elapsed_s, 10);
    }

    #[test]
    fn test_closing_ends_countdown_and_display() {
        let mut core = opened_core(5);
        let step = core.observe(GateState::Closing, Utc::now(), &thresholds(5, 10));
        assert!(step.phase_changed);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
        assert_eq!(core.state(), &GateAutomationState::default());

        let mut core = opened_core(1);
        core.tick();
        assert_eq!(core.phase(), AutomatonPhase::OpenDurationDisplay);
        core.observe(GateState::Closed, Utc::now(), &thresholds(1, 10));
        assert_eq!(core.phase(), AutomatonPhase::Idle);
    }

    #[test]
    fn test_repeated_open_does_not_restart() {
        let mut core = opened_core(250);
        core.tick();
        let step = core.observe(GateState::Open, Utc::now(), &thresholds(250, 10));
        assert_eq!(step, Step::default());
        assert_eq!(core.state().auto_close_remaining_s, 249);
    }

    #[test]
    fn test_toggle_at_closed_gate_starts_confirmation() {
        let mut core = AutomatonCore::new();
        let step = core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &thresholds(250, 10));

        assert_eq!(
            step.notices,
            vec![Notice::CommandSent, Notice::WatchingForOpening { attempt: 1 }]
        );
        assert_eq!(core.phase(), AutomatonPhase::AwaitingOpenConfirmation);
        assert_eq!(core.state().confirmation_remaining_s, 10);
        assert!(core.is_probing());
    }

    #[test]
    fn test_other_commands_are_not_watched() {
        let t = thresholds(250, 10);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Stop, "Anna", GateState::Closed, &t);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Open, &t);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
    }

    #[test]
    fn test_opening_confirms_immediately() {
        let t = thresholds(250, 10);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);
        probe_n(&mut core, 8);

        let step = core.observe(GateState::Opening, Utc::now(), &t);
        assert_eq!(step.notices, vec![Notice::OpeningConfirmed]);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
        assert!(!core.is_probing());
    }

    #[test]
    fn test_open_while_awaiting_starts_countdown() {
        let t = thresholds(250, 10);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);

        let step = core.observe(GateState::Open, Utc::now(), &t);
        assert_eq!(step.notices, vec![Notice::OpeningConfirmed]);
        assert_eq!(core.phase(), AutomatonPhase::AutoCloseCountdown);
    }

    #[test]
    fn test_window_elapses_into_single_republish() {
        let t = thresholds(250, 10);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);

        let steps = probe_n(&mut core, 19);
        assert!(steps.iter().all(|s| s.republish.is_none()));

        let step = core.probe();
        assert_eq!(
            step.republish,
            Some(Republish {
                kind: CommandKind::Toggle,
                actor: "Anna".to_string()
            })
        );
        assert_eq!(step.notices, vec![Notice::RetryingCommand]);
        assert!(core.is_republishing());
        // No probing while the republish is out
        assert_eq!(core.probe(), Step::default());

        let step = core.republish_finished(Ok(()), &t);
        assert_eq!(step.notices, vec![Notice::WatchingForOpening { attempt: 2 }]);
        assert_eq!(core.state().confirmation_remaining_s, 10);

        let steps = probe_n(&mut core, 20);
        assert!(steps.iter().all(|s| s.republish.is_none()));
        assert_eq!(steps[19].notices, vec![Notice::OpenNotConfirmed]);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
    }

    #[test]
    fn test_failed_republish_ends_cycle() {
        let t = thresholds(250, 1);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);
        probe_n(&mut core, 2);
        assert!(core.is_republishing());

        let step = core.republish_finished(Err("timed out".to_string()), &t);
        assert_eq!(
            step.notices,
            vec![Notice::RetryFailed {
                reason: "timed out".to_string()
            }]
        );
        assert_eq!(core.phase(), AutomatonPhase::Idle);
    }

    #[test]
    fn test_closing_cancels_confirmation() {
        let t = thresholds(250, 10);
        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);

        let step = core.observe(GateState::Closing, Utc::now(), &t);
        assert_eq!(step.notices, vec![Notice::ConfirmationCancelled]);
        assert_eq!(core.phase(), AutomatonPhase::Idle);

        // A late republish result is ignored
        assert_eq!(core.republish_finished(Ok(()), &t), Step::default());
    }

    #[test]
    fn test_restore_rebuilds_countdown_from_opened_at() {
        let now = Utc::now();
        let t = thresholds(250, 10);
        let mut snapshot = opened_core(250).snapshot(Uuid::new_v4(), now);

        snapshot.opened_at = Some(now - chrono::Duration::seconds(100));
        let mut core = AutomatonCore::new();
        core.restore(&snapshot, now, &t);
        assert_eq!(core.phase(), AutomatonPhase::AutoCloseCountdown);
        assert_eq!(core.state().auto_close_remaining_s, 150);

        snapshot.opened_at = Some(now - chrono::Duration::seconds(300));
        let mut core = AutomatonCore::new();
        core.restore(&snapshot, now, &t);
        assert_eq!(core.phase(), AutomatonPhase::OpenDurationDisplay);
        assert_eq!(core.state().open_duration_elapsed_s, 50);
    }

    #[test]
    fn test_restore_idle_stops_countdown() {
        let now = Utc::now();
        let t = thresholds(250, 10);
        let mut core = opened_core(250);
        let idle = AutomatonCore::new().snapshot(Uuid::new_v4(), now);

        let step = core.restore(&idle, now, &t);
        assert!(step.phase_changed);
        assert_eq!(core.phase(), AutomatonPhase::Idle);
    }

    #[test]
    fn test_local_confirmation_wins_over_broadcast() {
        let now = Utc::now();
        let t = thresholds(250, 10);
        let snapshot = opened_core(250).snapshot(Uuid::new_v4(), now);

        let mut core = AutomatonCore::new();
        core.command_issued(CommandKind::Toggle, "Anna", GateState::Closed, &t);
        assert_eq!(core.restore(&snapshot, now, &t), Step::default());
        assert_eq!(core.phase(), AutomatonPhase::AwaitingOpenConfirmation);
    }
}
