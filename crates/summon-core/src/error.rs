use std::any::Any;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors raised by the composition runtime.
///
/// Most variants are contract violations: they are programmer errors and are
/// raised eagerly from inside composable bodies (see [`RuntimeError::raise`]),
/// then caught at the nearest restartable group so sibling groups keep
/// composing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error(
        "slot {index} of group {group} holds `{found}` but `{expected}` was requested; \
         remember/effect calls must not be conditional (wrap the branch in `keyed`)"
    )]
    SlotTypeMismatch {
        group: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error(
        "group {group} used {found} slots but its previous composition used {expected}; \
         remember/effect calls must not be conditional (wrap the branch in `keyed`)"
    )]
    SlotCountMismatch {
        group: String,
        expected: usize,
        found: usize,
    },

    #[error("sibling groups at {group} share a call site without an explicit key")]
    DuplicateKey { group: String },

    #[error("unbalanced start_node/end_node in group {group}")]
    NodeMismatch { group: String },

    #[error("no provider for composition local `{name}`")]
    MissingProvider { name: &'static str },

    #[error("`{operation}` called outside of an active composition")]
    NotComposing { operation: &'static str },

    #[error("composition has been disposed")]
    Disposed,

    #[error("composable in group {group} panicked: {message}")]
    ComposablePanicked { group: String, message: String },

    /// `errors` holds the group failures reported by the passes that did run.
    #[error("recomposition did not settle after {passes} passes ({} group failures)", .errors.len())]
    Unsettled {
        passes: usize,
        errors: Vec<RuntimeError>,
    },

    #[error("failed to launch task: {0}")]
    Launch(String),
}

impl RuntimeError {
    /// Fails fast from inside a composable body.
    ///
    /// The payload is caught by the enclosing restartable group, which is
    /// flagged as failed and reported from `set_content`/`recompose`.
    pub fn raise(self) -> ! {
        std::panic::panic_any(self)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>, group: String) -> Self {
        match payload.downcast::<RuntimeError>() {
            Ok(err) => *err,
            Err(payload) => RuntimeError::ComposablePanicked {
                group,
                message: panic_message(&*payload),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("lifecycle owner is destroyed")]
    Destroyed,
}

/// Returned by cancellable work that was cut short. Not a failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Default)]
#[error("cancelled")]
pub struct Cancelled;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<RuntimeError>() {
        err.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
