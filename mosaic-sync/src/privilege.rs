//! Role-based authorization.
//!
//! [`PrivilegeGate::authorize`] is the only place privilege is decided.
//! The engine consults it before every mutation.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Role supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Anonymous,
    Authenticated,
    Admin,
}

/// Capabilities a request may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    WriteCell,
    DeleteCell,
    ClearGrid,
    BypassCooldown,
}

/// Static role × operation policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivilegeGate;

impl PrivilegeGate {
    pub fn authorize(role: Role, operation: Operation) -> bool {
        match (role, operation) {
            (Role::Admin, _) => true,
            (Role::Authenticated, Operation::WriteCell) => true,
            (Role::Authenticated, _) => false,
            (Role::Anonymous, _) => false,
        }
    }

    /// Like [`authorize`](Self::authorize), but as a `Result` for `?` chains.
    pub fn require(role: Role, operation: Operation) -> Result<(), SyncError> {
        if Self::authorize(role, operation) {
            Ok(())
        } else {
            Err(SyncError::Unauthorized { role, operation })
        }
    }
}
