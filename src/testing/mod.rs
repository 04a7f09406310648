//! Testing utilities and mock implementations
//!
//! Mocks stand in for the broker and the HTTP proxy so client, pool and
//! automaton behavior can be tested without network access.

pub mod mocks;

pub use mocks::*;
