use std::any::Any;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::Location;
use std::rc::Rc;

use bitflags::bitflags;

use crate::locals::LocalsSnapshot;
use crate::reactive::{Observer, Tracker};
use crate::render_api::{Attrs, NodeHandle};

slotmap::new_key_type! {
    /// Identity of one group in a composition's group tree.
    pub struct GroupId;
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub(crate) struct GroupFlags: u8 {
        /// Owns a body and a read tracker; can be re-invoked alone.
        const RESTARTABLE = 1 << 0;
        const DIRTY = 1 << 1;
        const FAILED = 1 << 2;
        const REMOVED = 1 << 3;
        /// Completed at least one pass; its slot layout is now fixed.
        const COMPOSED = 1 << 4;
    }
}

/// Identity of a group among its siblings: the call site, plus an explicit
/// key when one was given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    site: u64,
    explicit: Option<u64>,
}

impl GroupKey {
    pub fn at(location: &Location<'_>) -> Self {
        let mut h = DefaultHasher::new();
        location.file().hash(&mut h);
        location.line().hash(&mut h);
        location.column().hash(&mut h);
        Self {
            site: h.finish(),
            explicit: None,
        }
    }

    pub fn keyed<K: Hash + ?Sized>(location: &Location<'_>, key: &K) -> Self {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        Self {
            explicit: Some(h.finish()),
            ..Self::at(location)
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit.is_some()
    }
}

pub(crate) struct Slot {
    pub type_name: &'static str,
    pub value: Box<dyn Any>,
}

impl Slot {
    pub fn new<T: 'static>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }
}

pub(crate) struct NodeRecord {
    pub handle: NodeHandle,
    pub kind: &'static str,
    pub attrs: Attrs,
}

pub(crate) struct Group {
    pub key: GroupKey,
    pub origin: &'static Location<'static>,
    pub parent: Option<GroupId>,
    pub depth: u32,
    /// Creation order; breaks ties between dirty groups of equal depth.
    pub seq: u64,
    pub flags: GroupFlags,
    pub slots: Vec<Slot>,
    pub children: Vec<GroupId>,
    pub body: Option<Rc<dyn Fn()>>,
    pub observer: Option<Rc<dyn Observer>>,
    pub tracker: Option<Rc<Tracker>>,
    pub locals: LocalsSnapshot,
    pub disposables: Vec<Box<dyn FnOnce()>>,
    pub node: Option<NodeRecord>,
}

impl Group {
    pub fn new(
        key: GroupKey,
        origin: &'static Location<'static>,
        parent: Option<GroupId>,
        depth: u32,
        seq: u64,
    ) -> Self {
        Self {
            key,
            origin,
            parent,
            depth,
            seq,
            flags: GroupFlags::empty(),
            slots: Vec::new(),
            children: Vec::new(),
            body: None,
            observer: None,
            tracker: None,
            locals: LocalsSnapshot::default(),
            disposables: Vec::new(),
            node: None,
        }
    }

    pub fn label(&self) -> String {
        site(self.origin)
    }
}

pub(crate) fn site(origin: &Location<'_>) -> String {
    format!("{}:{}:{}", origin.file(), origin.line(), origin.column())
}
