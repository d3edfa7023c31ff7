//! # Composition locals
//!
//! Ambient values available to nested composables without parameter
//! threading. Declare one as a `static`:
//!
//! ```rust
//! use summon_core::CompositionLocal;
//!
//! static LOCAL_ACCENT: CompositionLocal<&'static str> = CompositionLocal::new("LocalAccent");
//!
//! LOCAL_ACCENT.provides("teal", || {
//!     assert_eq!(LOCAL_ACCENT.current(), "teal");
//!     LOCAL_ACCENT.provides("amber", || assert_eq!(LOCAL_ACCENT.current(), "amber"));
//!     assert_eq!(LOCAL_ACCENT.current(), "teal");
//! });
//! assert!(LOCAL_ACCENT.try_current().is_err());
//! ```
//!
//! Bindings live on a thread‑local persistent stack, so independent
//! compositions on other threads never see each other's values. Every group
//! snapshots the stack when it starts; restarting the group alone re-enters
//! that snapshot, so a recomposed child still sees what its ancestors
//! provided.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::RuntimeError;

thread_local! {
    static LOCALS: RefCell<LocalsSnapshot> = RefCell::new(LocalsSnapshot::default());
}

struct LocalsFrame {
    key: usize,
    value: Rc<dyn Any>,
    parent: Option<Rc<LocalsFrame>>,
}

/// Immutable view of the bindings in effect at some point.
#[derive(Clone, Default)]
pub struct LocalsSnapshot(Option<Rc<LocalsFrame>>);

impl LocalsSnapshot {
    fn lookup(&self, key: usize) -> Option<Rc<dyn Any>> {
        let mut frame = self.0.as_ref();
        while let Some(f) = frame {
            if f.key == key {
                return Some(f.value.clone());
            }
            frame = f.parent.as_ref();
        }
        None
    }
}

pub(crate) fn snapshot() -> LocalsSnapshot {
    LOCALS.with(|l| l.borrow().clone())
}

/// Restores the previous bindings when dropped, including on unwind.
pub(crate) struct LocalsGuard {
    previous: Option<LocalsSnapshot>,
}

impl Drop for LocalsGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            LOCALS.with(|l| *l.borrow_mut() = previous);
        }
    }
}

pub(crate) fn enter(snapshot: LocalsSnapshot) -> LocalsGuard {
    let previous = LOCALS.with(|l| std::mem::replace(&mut *l.borrow_mut(), snapshot));
    LocalsGuard {
        previous: Some(previous),
    }
}

pub struct CompositionLocal<T: 'static> {
    name: &'static str,
    default: Option<fn() -> T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> CompositionLocal<T> {
    /// A local without a default; reading it with no provider is an error.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            default: None,
            _marker: PhantomData,
        }
    }

    pub const fn with_default(name: &'static str, default: fn() -> T) -> Self {
        Self {
            name,
            default: Some(default),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn key(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Binds `value` for the duration of `content`. Nested calls shadow.
    pub fn provides<R>(&'static self, value: T, content: impl FnOnce() -> R) -> R {
        let parent = snapshot().0;
        let frame = LocalsFrame {
            key: self.key(),
            value: Rc::new(value),
            parent,
        };
        let _guard = enter(LocalsSnapshot(Some(Rc::new(frame))));
        content()
    }

    pub fn try_current(&'static self) -> Result<T, RuntimeError> {
        let found = snapshot().lookup(self.key());
        if let Some(v) = found.as_ref().and_then(|v| v.downcast_ref::<T>()) {
            return Ok(v.clone());
        }
        self.default
            .map(|default| default())
            .ok_or(RuntimeError::MissingProvider { name: self.name })
    }

    /// Nearest provided value; fails fast with `MissingProvider`.
    pub fn current(&'static self) -> T {
        self.try_current().unwrap_or_else(|e| e.raise())
    }
}
