//! Read tracking.
//!
//! Every tracked read goes through [`record_read`]. The innermost active
//! [`Tracker`] (a restartable group or a derived state being computed)
//! receives the read and subscribes its observer to the state. Writes walk a
//! state's subscriber list and call `on_state_changed` on each live observer.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something that reacts to writes of the states it read.
pub(crate) trait Observer {
    fn on_state_changed(&self);
}

/// Something that can be read under tracking.
pub(crate) trait StateObject {
    fn state_id(&self) -> StateId;
    fn subscribers(&self) -> &Subscribers;
}

thread_local! {
    static TRACKERS: RefCell<Vec<Rc<Tracker>>> = const { RefCell::new(Vec::new()) };
    static UNTRACKED: Cell<u32> = const { Cell::new(0) };
}

#[derive(Default)]
pub(crate) struct Subscribers(RefCell<SmallVec<[(ObserverId, Weak<dyn Observer>); 2]>>);

impl Subscribers {
    fn add(&self, id: ObserverId, observer: Weak<dyn Observer>) {
        let mut subs = self.0.borrow_mut();
        if !subs.iter().any(|(existing, _)| *existing == id) {
            subs.push((id, observer));
        }
    }

    fn remove(&self, id: ObserverId) {
        self.0.borrow_mut().retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|(_, observer)| observer.strong_count() > 0)
            .count()
    }

    /// Notifies every live observer. The list is snapshotted first so
    /// observers may subscribe or unsubscribe while being notified.
    pub(crate) fn notify(&self) {
        let live: SmallVec<[Rc<dyn Observer>; 4]> = {
            let mut subs = self.0.borrow_mut();
            subs.retain(|(_, observer)| observer.strong_count() > 0);
            subs.iter().filter_map(|(_, observer)| observer.upgrade()).collect()
        };
        for observer in live {
            observer.on_state_changed();
        }
    }
}

/// The read set of one observer across one execution.
pub(crate) struct Tracker {
    observer: Weak<dyn Observer>,
    id: ObserverId,
    reads: RefCell<SmallVec<[Rc<dyn StateObject>; 4]>>,
}

impl Tracker {
    pub(crate) fn new(observer: Weak<dyn Observer>) -> Self {
        Self {
            observer,
            id: ObserverId::next(),
            reads: RefCell::new(SmallVec::new()),
        }
    }

    fn record(&self, state: Rc<dyn StateObject>) {
        let id = state.state_id();
        if self.has_read(id) {
            return;
        }
        state.subscribers().add(self.id, self.observer.clone());
        self.reads.borrow_mut().push(state);
    }

    pub(crate) fn has_read(&self, id: StateId) -> bool {
        self.reads.borrow().iter().any(|s| s.state_id() == id)
    }

    /// Drops every edge recorded by the previous execution.
    pub(crate) fn reset(&self) {
        let reads = std::mem::take(&mut *self.reads.borrow_mut());
        for state in reads {
            state.subscribers().remove(self.id);
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Runs `f` with `tracker` receiving all tracked reads.
pub(crate) fn with_tracker<R>(tracker: &Rc<Tracker>, f: impl FnOnce() -> R) -> R {
    // Non-panicking frame guard (ensures pop on unwind)
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            TRACKERS.with(|t| {
                t.borrow_mut().pop();
            });
        }
    }
    TRACKERS.with(|t| t.borrow_mut().push(tracker.clone()));
    let _guard = Guard;
    f()
}

/// Runs `f` without recording any reads.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            UNTRACKED.with(|u| u.set(u.get() - 1));
        }
    }
    UNTRACKED.with(|u| u.set(u.get() + 1));
    let _guard = Guard;
    f()
}

pub(crate) fn record_read(state: Rc<dyn StateObject>) {
    if UNTRACKED.with(|u| u.get() > 0) {
        return;
    }
    let top = TRACKERS.with(|t| t.borrow().last().cloned());
    if let Some(tracker) = top {
        tracker.record(state);
    }
}

pub(crate) fn record_write(id: StateId) {
    let read_here = TRACKERS.with(|t| t.borrow().last().is_some_and(|top| top.has_read(id)));
    if read_here {
        log::warn!(
            "state {id:?} written after being read in the same execution; \
             its readers recompose in the next pass"
        );
    }
}
