//! Error types for TabletDB.
//!
//! All library crates in this workspace return [`TabletDbError`] through the
//! [`TabletDbResult`] alias. The taxonomy is closed on purpose: callers
//! dispatch on the *kind* of failure (permanent, conflict, transient,
//! indeterminate) to decide whether to report, re-read and retry, back off,
//! or fence and give up, so ad-hoc stringly errors are only allowed behind
//! [`TabletDbError::Internal`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across the workspace.
pub type TabletDbResult<T> = Result<T, TabletDbError>;

/// An error that can occur in any TabletDB component.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TabletDbError {
    /// A node addressed in the coordination service does not exist.
    #[error("coordination node not found: {path}")]
    NotFound {
        /// Path of the missing node
        path: String,
    },

    /// A node create with a fail-if-exists policy hit an existing node.
    #[error("coordination node already exists: {path}")]
    AlreadyExists {
        /// Path of the conflicting node
        path: String,
    },

    /// A conditional update lost the race on a node's version.
    #[error("version mismatch updating {path}")]
    VersionMismatch {
        /// Path of the contended node
        path: String,
    },

    /// The coordination session dropped mid-operation. Read paths recover
    /// from this transparently; mutation paths surface it to the caller.
    #[error("disconnected from coordination service")]
    Disconnected,

    /// The caller handed us something structurally unusable. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutation failed a table constraint. Never retried.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The caller lacks permission for the operation. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A conditional mutation was rejected; the caller may re-read the
    /// tablet's metadata to diagnose and decide whether to retry.
    #[error("conditional mutation rejected for tablet {extent}")]
    ConditionalRejected {
        /// Display form of the rejected extent
        extent: String,
    },

    /// An operation's outcome is indeterminate and no fence exists to
    /// resolve it.
    #[error("operation outcome unknown: {0}")]
    Unknown(String),

    /// An I/O error from the local or distributed filesystem. Retried with
    /// bounded backoff before being surfaced.
    #[error("I/O error: {context}: {message}")]
    Io {
        /// What the component was doing
        context: String,
        /// Stringified source error
        message: String,
    },

    /// A deadline elapsed before the operation completed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The addressed table does not exist.
    #[error("table {0} does not exist")]
    TableNotFound(String),

    /// The addressed tablet is not hosted on this server.
    #[error("tablet {0} is not hosted here")]
    TabletNotHosted(String),

    /// The referenced server-side session is gone (expired or invalidated).
    #[error("no such session: {0}")]
    NoSuchSession(u64),

    /// A FATE transaction id did not resolve to a live transaction.
    #[error("no such FATE transaction: {0}")]
    NoSuchFateTransaction(String),

    /// Serializing or deserializing a persisted payload failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// An invariant the code relies on did not hold. Always a bug.
    #[error("internal invariant failed: {0}")]
    Internal(String),
}

impl TabletDbError {
    /// Whether a retry of the same operation can ever succeed without the
    /// caller changing something first.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TabletDbError::Disconnected | TabletDbError::Io { .. } | TabletDbError::TimedOut(_)
        )
    }

    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        TabletDbError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

impl From<bincode::Error> for TabletDbError {
    fn from(err: bincode::Error) -> Self {
        TabletDbError::Serialization(err.to_string())
    }
}

/// Return early with a [`TabletDbError::Internal`].
#[macro_export]
macro_rules! internal {
    ($($tt:tt)*) => {
        return Err($crate::internal_err!($($tt)*).into())
    };
}

/// Construct a [`TabletDbError::Internal`] with `format!`-style arguments.
#[macro_export]
macro_rules! internal_err {
    ($($tt:tt)*) => {
        $crate::TabletDbError::Internal(format!($($tt)*))
    };
}

/// Check a condition, returning a [`TabletDbError::Internal`] naming it if it
/// does not hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !$cond {
            $crate::internal!("invariant violated: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($tt:tt)*) => {
        if !$cond {
            $crate::internal!($($tt)*);
        }
    };
}

/// Check two expressions for equality, returning a
/// [`TabletDbError::Internal`] showing both values if they differ.
#[macro_export]
macro_rules! invariant_eq {
    ($a:expr, $b:expr) => {{
        let (a, b) = (&$a, &$b);
        if a != b {
            $crate::internal!(
                "invariant violated: {} == {} ({:?} != {:?})",
                stringify!($a),
                stringify!($b),
                a,
                b
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trips() -> TabletDbResult<()> {
        invariant!(1 + 1 == 3, "arithmetic broke: {}", 2);
        Ok(())
    }

    #[test]
    fn invariant_macro_returns_internal() {
        match trips() {
            Err(TabletDbError::Internal(msg)) => assert!(msg.contains("arithmetic broke")),
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[test]
    fn transience() {
        assert!(TabletDbError::Disconnected.is_transient());
        assert!(!TabletDbError::InvalidArgument("x".into()).is_transient());
        assert!(!TabletDbError::ConditionalRejected { extent: "t".into() }.is_transient());
    }
}
