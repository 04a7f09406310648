//! Gate timing automaton
//!
//! Watches the gate state and drives three timed behaviors:
//!
//! - an auto-close countdown that starts when the gate reports open and
//!   turns into an open-duration display once the limit passes
//! - an open-confirmation window after a toggle sent to a closed gate,
//!   with one automatic republish if the gate never starts opening
//! - sharing of the current phase with other instances through a
//!   [`SyncStore`], so every window shows the same countdown
//!
//! [`state`] is the pure core; [`driver`] owns the timers and I/O.

pub mod display;
pub mod driver;
pub mod settings;
pub mod state;
pub mod sync;

pub use display::{format_countdown, phase_caption};
pub use driver::{CommandPublisher, GateAutomaton};
pub use settings::{SettingsSource, Thresholds, WatchSettings};
pub use state::{AutomatonCore, AutomatonPhase, GateAutomationState, Notice, Step};
pub use sync::{FileSyncStore, MemorySyncStore, SyncSnapshot, SyncStore, SyncUpdate, SYNC_KEY};
