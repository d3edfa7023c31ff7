use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::reactive::{self, Observer, StateId, StateObject, Subscribers, Tracker};
use crate::remember;

/// Observable value.
///
/// Reads made while a restartable group (or a derived state) executes are
/// recorded, and a write schedules those readers for recomposition. The write
/// itself never re-enters composition.
pub struct State<T: 'static>(Rc<StateCell<T>>);

struct StateCell<T> {
    id: StateId,
    value: RefCell<T>,
    subscribers: Subscribers,
}

impl<T: 'static> StateObject for StateCell<T> {
    fn state_id(&self) -> StateId {
        self.id
    }
    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }
}

impl<T: 'static> State<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(StateCell {
            id: StateId::next(),
            value: RefCell::new(value),
            subscribers: Subscribers::default(),
        }))
    }

    pub fn id(&self) -> StateId {
        self.0.id
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.track();
        self.0.value.borrow().clone()
    }

    /// Tracked read without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.0.value.borrow())
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.0.value.borrow().clone()
    }

    pub fn set(&self, v: T) {
        *self.0.value.borrow_mut() = v;
        self.notify();
    }

    pub fn replace(&self, v: T) -> T {
        let old = std::mem::replace(&mut *self.0.value.borrow_mut(), v);
        self.notify();
        old
    }

    /// Applies `f` to a copy of the value, then stores it. `f` may read this
    /// state; it sees the value from before the update.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F)
    where
        T: Clone,
    {
        let mut value = self.0.value.borrow().clone();
        f(&mut value);
        *self.0.value.borrow_mut() = value;
        self.notify();
    }

    /// Number of live observers currently depending on this state.
    pub fn observer_count(&self) -> usize {
        self.0.subscribers.len()
    }

    fn track(&self) {
        let object: Rc<dyn StateObject> = self.0.clone();
        reactive::record_read(object);
    }

    fn notify(&self) {
        reactive::record_write(self.0.id);
        self.0.subscribers.notify();
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Identity comparison, so states can be used as effect keys.
impl<T> PartialEq for State<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: fmt::Debug> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.0.id)
            .field("value", &*self.0.value.borrow())
            .finish()
    }
}

pub fn mutable_state_of<T: 'static>(value: T) -> State<T> {
    State::new(value)
}

/// A `State` stored in the current group's slot table.
pub fn remember_state<T: 'static>(init: impl FnOnce() -> T) -> State<T> {
    remember(|| State::new(init()))
}

/// Cached computation over other states.
///
/// The cache is dropped only when an upstream state it read is written, and
/// readers of the derived value are tracked like readers of a plain `State`.
pub struct DerivedState<T: 'static>(Rc<DerivedCell<T>>);

struct DerivedCell<T> {
    id: StateId,
    compute: Box<dyn Fn() -> T>,
    cached: RefCell<Option<T>>,
    tracker: Rc<Tracker>,
    subscribers: Subscribers,
    computations: Cell<u64>,
}

impl<T: 'static> StateObject for DerivedCell<T> {
    fn state_id(&self) -> StateId {
        self.id
    }
    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }
}

impl<T: 'static> Observer for DerivedCell<T> {
    fn on_state_changed(&self) {
        // Already stale means downstream was told and has not read since.
        let was_cached = self.cached.borrow_mut().take().is_some();
        if was_cached {
            self.subscribers.notify();
        }
    }
}

impl<T: Clone + 'static> DerivedState<T> {
    pub fn new(compute: impl Fn() -> T + 'static) -> Self {
        let cell = Rc::new_cyclic(|weak: &Weak<DerivedCell<T>>| {
            let observer: Weak<dyn Observer> = weak.clone();
            DerivedCell {
                id: StateId::next(),
                compute: Box::new(compute),
                cached: RefCell::new(None),
                tracker: Rc::new(Tracker::new(observer)),
                subscribers: Subscribers::default(),
                computations: Cell::new(0),
            }
        });
        Self(cell)
    }

    pub fn get(&self) -> T {
        let object: Rc<dyn StateObject> = self.0.clone();
        reactive::record_read(object);

        if let Some(v) = self.0.cached.borrow().as_ref() {
            return v.clone();
        }
        self.0.tracker.reset();
        let v = reactive::with_tracker(&self.0.tracker, || (self.0.compute)());
        self.0.computations.set(self.0.computations.get() + 1);
        *self.0.cached.borrow_mut() = Some(v.clone());
        v
    }

    /// How many times the value was computed.
    pub fn computations(&self) -> u64 {
        self.0.computations.get()
    }

    pub fn observer_count(&self) -> usize {
        self.0.subscribers.len()
    }
}

impl<T> Clone for DerivedState<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

pub fn derived_state_of<T: Clone + 'static>(compute: impl Fn() -> T + 'static) -> DerivedState<T> {
    DerivedState::new(compute)
}

/// A `DerivedState` stored in the current group's slot table.
pub fn remember_derived<T: Clone + 'static>(
    compute: impl Fn() -> T + 'static,
) -> DerivedState<T> {
    remember(|| DerivedState::new(compute))
}
