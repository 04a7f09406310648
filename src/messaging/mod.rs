//! Messaging client and its observer plumbing
//!
//! - [`client`] - [`MessagingClient`], the orchestrator over the transports
//! - [`listeners`] - listener lists with per-callback panic isolation
//! - [`access`] - the "may this actor issue this command" check

pub mod access;
pub mod client;
pub mod listeners;

pub use access::{AllowAll, CommandAuthorizer, PermissionTable, SharedAuthorizer};
pub use client::{connectors_for, derive_quality, MessagingClient, CLIENT_BREAKER_NAME};
pub use listeners::{Callback, ListenerId, Listeners};
