//! Command authorization
//!
//! Identity and permission storage live outside this crate; the client only
//! asks whether an actor may issue a given command.

use crate::config::AccessSection;
use crate::protocol::CommandKind;
use std::fmt::Debug;
use std::sync::Arc;

/// Decides whether `actor` may issue a command of `kind`
pub trait CommandAuthorizer: Send + Sync + Debug {
    fn may_issue(&self, actor: &str, kind: CommandKind) -> bool;
}

pub type SharedAuthorizer = Arc<dyn CommandAuthorizer>;

/// Static permission table loaded from the `[access]` section
#[derive(Debug, Clone)]
pub struct PermissionTable {
    access: AccessSection,
}

impl PermissionTable {
    pub fn new(access: AccessSection) -> Self {
        Self { access }
    }
}

impl CommandAuthorizer for PermissionTable {
    fn may_issue(&self, actor: &str, kind: CommandKind) -> bool {
        self.access.allows(actor.trim(), kind)
    }
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CommandAuthorizer for AllowAll {
    fn may_issue(&self, _actor: &str, _kind: CommandKind) -> bool {
        true
    }
}
