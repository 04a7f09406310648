//! Timing thresholds and the settings collaborator
//!
//! Thresholds are owned by an external settings store; the automaton only
//! reads them, and reads them again at every decision so edits apply to the
//! next cycle.

use crate::config::ThresholdsSection;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::watch;
use tracing::info;

pub const DEFAULT_AUTO_CLOSE_TIME_LIMIT_S: u32 = 250;
pub const DEFAULT_RETRY_TIME_LIMIT_S: u32 = 3;
pub const DEFAULT_OPEN_CHECK_TIME_LIMIT_S: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub auto_close_time_limit_s: u32,
    pub retry_time_limit_s: u32,
    pub open_check_time_limit_s: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_close_time_limit_s: DEFAULT_AUTO_CLOSE_TIME_LIMIT_S,
            retry_time_limit_s: DEFAULT_RETRY_TIME_LIMIT_S,
            open_check_time_limit_s: DEFAULT_OPEN_CHECK_TIME_LIMIT_S,
        }
    }
}

impl Thresholds {
    /// Zero means "unset" in the settings store; fall back to the defaults
    pub fn sanitized(self) -> Self {
        let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
        Self {
            auto_close_time_limit_s: or_default(
                self.auto_close_time_limit_s,
                DEFAULT_AUTO_CLOSE_TIME_LIMIT_S,
            ),
            retry_time_limit_s: or_default(self.retry_time_limit_s, DEFAULT_RETRY_TIME_LIMIT_S),
            open_check_time_limit_s: or_default(
                self.open_check_time_limit_s,
                DEFAULT_OPEN_CHECK_TIME_LIMIT_S,
            ),
        }
    }
}

impl From<&ThresholdsSection> for Thresholds {
    fn from(section: &ThresholdsSection) -> Self {
        Self {
            auto_close_time_limit_s: section.auto_close_time_limit_s,
            retry_time_limit_s: section.retry_time_limit_s,
            open_check_time_limit_s: section.open_check_time_limit_s,
        }
        .sanitized()
    }
}

/// Read access to the thresholds plus change notification
pub trait SettingsSource: Send + Sync + Debug {
    fn read(&self) -> Thresholds;

    fn subscribe(&self) -> watch::Receiver<Thresholds>;
}

/// In-process settings backed by a watch channel
#[derive(Debug)]
pub struct WatchSettings {
    tx: watch::Sender<Thresholds>,
}

impl WatchSettings {
    pub fn new(initial: Thresholds) -> Self {
        let (tx, _) = watch::channel(initial.sanitized());
        Self { tx }
    }

    /// Replace the thresholds, as the settings store would on an edit
    pub fn update(&self, thresholds: Thresholds) {
        let thresholds = thresholds.sanitized();
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != thresholds;
            *current = thresholds;
            changed
        });
        if changed {
            info!(?thresholds, "Gate thresholds updated");
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl SettingsSource for WatchSettings {
    fn read(&self) -> Thresholds {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Thresholds> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_falls_back_to_defaults() {
        let thresholds = Thresholds {
            auto_close_time_limit_s: 0,
            retry_time_limit_s: 5,
            open_check_time_limit_s: 0,
        }
        .sanitized();
        assert_eq!(thresholds.auto_close_time_limit_s, 250);
        assert_eq!(thresholds.retry_time_limit_s, 5);
        assert_eq!(thresholds.open_check_time_limit_s, 10);
    }

    #[tokio::test]
    async fn test_updates_reach_subscribers() {
        let settings = WatchSettings::default();
        let mut rx = settings.subscribe();

        let edited = Thresholds {
            auto_close_time_limit_s: 120,
            ..Thresholds::default()
        };
        settings.update(edited);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), edited);
        assert_eq!(settings.read().auto_close_time_limit_s, 120);
    }

    #[test]
    fn test_identical_update_is_not_a_change() {
        let settings = WatchSettings::default();
        let rx = settings.subscribe();
        settings.update(Thresholds::default());
        assert!(!rx.has_changed().unwrap());
    }
}
