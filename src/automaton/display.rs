//! Text for countdown displays

use super::state::{AutomatonPhase, GateAutomationState};

/// `h:mm:ss` from one hour, `m:ss` from one minute, `Ns` below that
pub fn format_countdown(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else if minutes > 0 {
        format!("{minutes}:{secs:02}")
    } else {
        format!("{secs}s")
    }
}

/// One-line caption for the current phase, `None` when idle
pub fn phase_caption(state: &GateAutomationState) -> Option<String> {
    match state.phase {
        AutomatonPhase::Idle => None,
        AutomatonPhase::AutoCloseCountdown => Some(format!(
            "Automatické zavření za {}",
            format_countdown(u64::from(state.auto_close_remaining_s))
        )),
        AutomatonPhase::OpenDurationDisplay => Some(format!(
            "Otevřeno déle o {}",
            format_countdown(state.open_duration_elapsed_s)
        )),
        AutomatonPhase::AwaitingOpenConfirmation => Some(format!(
            "Kontrola otevření {}",
            format_countdown(u64::from(state.confirmation_remaining_s))
        )),
    }
}
