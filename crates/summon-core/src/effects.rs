use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

/// Cleanup guard returned by effect setups.
#[derive(Clone)]
pub struct Dispose(Rc<RefCell<Option<Box<dyn FnOnce()>>>>);

impl Dispose {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(f)))))
    }

    /// A guard with nothing to clean up.
    pub fn noop() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    /// Runs at most once (safe to call multiple times).
    pub fn run(&self) {
        let f = self.0.borrow_mut().take();
        if let Some(f) = f {
            f()
        }
    }

    pub fn is_spent(&self) -> bool {
        self.0.borrow().is_none()
    }
}

/// Helper to register cleanup inside effect.
pub fn on_unmount(f: impl FnOnce() + 'static) -> Dispose {
    Dispose::new(f)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectKind {
    Launched,
    Disposable,
    Side,
    /// A disposable registered on a group, run when the group leaves.
    Dispose,
}

/// Per-instance effect state: `Unmounted -> Mounted -> Disposed`.
///
/// A key change passes through cleanup and setup again and returns to
/// `Mounted`. `Failed` marks a setup that did not return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectPhase {
    Unmounted,
    Mounted,
    Failed,
    Disposed,
}

/// How a launched effect's task ended. Cancellation is not a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EffectOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectFailure {
    /// Call site of the group hosting the effect.
    pub group: String,
    pub kind: EffectKind,
    pub message: String,
}

/// Output types accepted from effect bodies.
pub trait EffectResult {
    fn into_outcome(self) -> EffectOutcome;
}

impl EffectResult for () {
    fn into_outcome(self) -> EffectOutcome {
        EffectOutcome::Completed
    }
}

impl<E: Display> EffectResult for Result<(), E> {
    fn into_outcome(self) -> EffectOutcome {
        match self {
            Ok(()) => EffectOutcome::Completed,
            Err(e) => EffectOutcome::Failed(e.to_string()),
        }
    }
}

/// Collects effect failures for the host; shared with in-flight tasks.
#[derive(Clone, Default)]
pub(crate) struct FailureSink(Rc<RefCell<Vec<EffectFailure>>>);

impl FailureSink {
    pub fn report(&self, failure: EffectFailure) {
        log::error!(
            "{:?} effect in {} failed: {}",
            failure.kind,
            failure.group,
            failure.message
        );
        self.0.borrow_mut().push(failure);
    }

    pub fn take(&self) -> Vec<EffectFailure> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}
