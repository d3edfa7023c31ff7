use std::cell::RefCell;
use std::collections::HashSet;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe, Location};
use std::rc::{Rc, Weak};

use slotmap::SlotMap;

use crate::config::{CompositionConfig, KeyPolicy};
use crate::effects::{EffectFailure, EffectKind, FailureSink};
use crate::error::{RuntimeError, panic_message};
use crate::group::{Group, GroupFlags, GroupId, GroupKey, NodeRecord, Slot, site};
use crate::launch::Launcher;
use crate::locals;
use crate::reactive::{self, Observer, Tracker};
use crate::render_api::{Attrs, NodeHandle, Renderer};

thread_local! {
    static CURRENT: RefCell<Option<Rc<ComposerShared>>> = const { RefCell::new(None) };
}

pub(crate) struct ComposerShared {
    state: RefCell<ComposerState>,
    renderer: RefCell<Box<dyn Renderer>>,
    launcher: Rc<dyn Launcher>,
    on_invalidate: RefCell<Option<Rc<dyn Fn()>>>,
    failures: FailureSink,
    config: CompositionConfig,
}

#[derive(Default)]
struct ComposerState {
    groups: SlotMap<GroupId, Group>,
    frames: Vec<Frame>,
    root: Option<GroupId>,
    dirty: HashSet<GroupId>,
    composing: bool,
    disposed: bool,
    /// The host was asked for a pass that has not started yet.
    frame_requested: bool,
    next_seq: u64,
    pending: Vec<PendingEffect>,
    removed: Vec<GroupId>,
    errors: Vec<RuntimeError>,
    recomposed: usize,
}

/// Cursor state for one open group.
struct Frame {
    group: GroupId,
    slot_cursor: usize,
    inserting: bool,
    /// Whether the group is added to the enclosing frame's children when it
    /// ends. Restarted groups keep their place in the parent instead.
    attached: bool,
    node_open: bool,
    old_children: Vec<GroupId>,
    reused: Vec<bool>,
    new_children: Vec<GroupId>,
    seen_keys: HashSet<GroupKey>,
}

impl Frame {
    fn new(group: GroupId, inserting: bool, attached: bool, old_children: Vec<GroupId>) -> Self {
        let reused = vec![false; old_children.len()];
        Self {
            group,
            slot_cursor: 0,
            inserting,
            attached,
            node_open: false,
            old_children,
            reused,
            new_children: Vec::new(),
            seen_keys: HashSet::new(),
        }
    }
}

struct PendingEffect {
    group: GroupId,
    kind: EffectKind,
    run: Box<dyn FnOnce()>,
}

struct GroupObserver {
    group: GroupId,
    composer: Weak<ComposerShared>,
}

impl Observer for GroupObserver {
    fn on_state_changed(&self) {
        if let Some(shared) = self.composer.upgrade() {
            shared.invalidate(self.group);
        }
    }
}

impl ComposerShared {
    fn invalidate(&self, id: GroupId) {
        let request_frame = {
            let mut st = self.state.borrow_mut();
            let Some(group) = st.groups.get_mut(id) else {
                return;
            };
            if group.flags.contains(GroupFlags::REMOVED) {
                return;
            }
            group.flags.insert(GroupFlags::DIRTY);
            st.dirty.insert(id);
            log::trace!("group {id:?} invalidated");
            let request = !st.composing && !st.disposed && !st.frame_requested;
            st.frame_requested |= request;
            request
        };
        if request_frame {
            self.request_frame();
        }
    }

    fn request_frame(&self) {
        let callback = self.on_invalidate.borrow().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Removes `id` and its descendants: children first, then the node, then
    /// the group's disposables in registration order.
    fn dispose_subtree(&self, id: GroupId, remove_node: bool) {
        let group = {
            let mut st = self.state.borrow_mut();
            st.dirty.remove(&id);
            st.groups.remove(id)
        };
        let Some(group) = group else {
            return;
        };
        let owns_node = remove_node && group.node.is_some();
        for child in &group.children {
            self.dispose_subtree(*child, remove_node && !owns_node);
        }
        if owns_node && let Some(node) = &group.node {
            self.renderer.borrow_mut().remove(node.handle);
        }
        let label = group.label();
        log::trace!("disposing group {label}");
        for disposable in group.disposables {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(disposable)) {
                self.failures.report(EffectFailure {
                    group: label.clone(),
                    kind: EffectKind::Dispose,
                    message: panic_message(&*payload),
                });
            }
        }
    }

    /// Effect-commit phase: removed groups first, then queued effects in
    /// registration order. Returns how many effects ran.
    fn commit(&self) -> usize {
        let (removed, pending) = {
            let mut st = self.state.borrow_mut();
            (
                std::mem::take(&mut st.removed),
                std::mem::take(&mut st.pending),
            )
        };
        for id in removed {
            self.dispose_subtree(id, true);
        }

        let mut ran = 0;
        for effect in pending {
            let label = {
                let st = self.state.borrow();
                match st.groups.get(effect.group) {
                    Some(g) if !g.flags.intersects(GroupFlags::FAILED | GroupFlags::REMOVED) => {
                        Some(g.label())
                    }
                    _ => None,
                }
            };
            let Some(label) = label else {
                log::debug!("dropping {:?} effect of a failed or removed group", effect.kind);
                continue;
            };
            ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(effect.run)) {
                self.failures.report(EffectFailure {
                    group: label,
                    kind: effect.kind,
                    message: panic_message(&*payload),
                });
            }
        }
        ran
    }
}

/// Marks a composition pass: installs the composer as current on this thread
/// and restores the previous one on drop, including on unwind.
struct PassGuard {
    shared: Rc<ComposerShared>,
    previous: Option<Rc<ComposerShared>>,
}

impl PassGuard {
    fn enter(shared: &Rc<ComposerShared>) -> Self {
        {
            let mut st = shared.state.borrow_mut();
            st.composing = true;
            st.frame_requested = false;
        }
        let previous = CURRENT.with(|c| c.borrow_mut().replace(shared.clone()));
        Self {
            shared: shared.clone(),
            previous,
        }
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.borrow_mut();
            st.composing = false;
            if !st.frames.is_empty() {
                log::warn!("composition pass ended with {} open groups", st.frames.len());
                st.frames.clear();
            }
        }
        CURRENT.with(|c| *c.borrow_mut() = self.previous.take());
    }
}

/// Handle to the composer driving the current pass.
///
/// This is the low-level contract composables are built on; most code uses
/// the free functions ([`remember`], [`restartable`], [`node`], ...) instead.
#[derive(Clone)]
pub struct Composer {
    shared: Rc<ComposerShared>,
}

/// The composer of the pass running on this thread.
pub fn current_composer() -> Result<Composer, RuntimeError> {
    CURRENT
        .with(|c| c.borrow().clone())
        .map(|shared| Composer { shared })
        .ok_or(RuntimeError::NotComposing {
            operation: "current_composer",
        })
}

pub fn is_composing() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

pub(crate) fn composer_for(operation: &'static str) -> Composer {
    CURRENT
        .with(|c| c.borrow().clone())
        .map(|shared| Composer { shared })
        .unwrap_or_else(|| RuntimeError::NotComposing { operation }.raise())
}

impl Composer {
    #[track_caller]
    pub fn start_group(&self, key: GroupKey) -> Result<GroupId, RuntimeError> {
        self.start_group_at(key, Location::caller(), GroupFlags::empty())
    }

    pub fn end_group(&self) -> Result<(), RuntimeError> {
        self.end_group_inner()
    }

    pub fn current_group(&self) -> Option<GroupId> {
        self.shared.state.borrow().frames.last().map(|f| f.group)
    }

    /// True while the current group is being composed for the first time.
    pub fn is_inserting(&self) -> bool {
        self.shared
            .state
            .borrow()
            .frames
            .last()
            .is_some_and(|f| f.inserting)
    }

    /// Returns the current slot index and advances the cursor.
    pub fn next_slot(&self) -> Result<usize, RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let frame = st.frames.last_mut().ok_or(RuntimeError::NotComposing {
            operation: "next_slot",
        })?;
        let index = frame.slot_cursor;
        frame.slot_cursor += 1;
        Ok(index)
    }

    /// Reads slot `index` of the current group. `Ok(None)` means the slot was
    /// never written.
    pub fn get_slot<T: Clone + 'static>(&self, index: usize) -> Result<Option<T>, RuntimeError> {
        let st = self.shared.state.borrow();
        let group = st
            .frames
            .last()
            .and_then(|f| st.groups.get(f.group))
            .ok_or(RuntimeError::NotComposing {
                operation: "get_slot",
            })?;
        let Some(slot) = group.slots.get(index) else {
            return Ok(None);
        };
        match slot.value.downcast_ref::<T>() {
            Some(v) => Ok(Some(v.clone())),
            None => Err(RuntimeError::SlotTypeMismatch {
                group: group.label(),
                index,
                expected: std::any::type_name::<T>(),
                found: slot.type_name,
            }),
        }
    }

    pub fn set_slot<T: 'static>(&self, index: usize, value: T) -> Result<(), RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let ComposerState { frames, groups, .. } = &mut *st;
        let group = frames
            .last()
            .and_then(|f| groups.get_mut(f.group))
            .ok_or(RuntimeError::NotComposing {
                operation: "set_slot",
            })?;
        let len = group.slots.len();
        if index < len {
            group.slots[index] = Slot::new(value);
        } else if index == len && !group.flags.contains(GroupFlags::COMPOSED) {
            group.slots.push(Slot::new(value));
        } else {
            // Slots may only be appended during a group's first composition.
            return Err(RuntimeError::SlotCountMismatch {
                group: group.label(),
                expected: len,
                found: index + 1,
            });
        }
        Ok(())
    }

    /// Compares `value` with the one stored at the next slot and stores it.
    /// True on first use and whenever the value differs.
    pub fn changed<T: PartialEq + Clone + 'static>(&self, value: &T) -> Result<bool, RuntimeError> {
        let index = self.next_slot()?;
        if self.get_slot::<T>(index)?.is_some_and(|prev| prev == *value) {
            return Ok(false);
        }
        self.set_slot(index, value.clone())?;
        Ok(true)
    }

    /// Stores `init()` at the next slot on first use and returns the stored
    /// value afterwards.
    pub fn remember_slot<T: Clone + 'static>(
        &self,
        init: impl FnOnce() -> T,
    ) -> Result<T, RuntimeError> {
        let index = self.next_slot()?;
        if let Some(v) = self.get_slot::<T>(index)? {
            return Ok(v);
        }
        let v = init();
        self.set_slot(index, v.clone())?;
        Ok(v)
    }

    /// Runs `f` once when the current group leaves the composition.
    pub fn register_disposable(&self, f: impl FnOnce() + 'static) -> Result<(), RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let ComposerState { frames, groups, .. } = &mut *st;
        let group = frames
            .last()
            .and_then(|f| groups.get_mut(f.group))
            .ok_or(RuntimeError::NotComposing {
                operation: "register_disposable",
            })?;
        group.disposables.push(Box::new(f));
        Ok(())
    }

    /// Materialises (or updates) the renderer node of the current group.
    ///
    /// A new node is placed right after the last node emitted before it under
    /// the same parent node, so the rendered order follows composition order.
    pub fn start_node(&self, kind: &'static str, attrs: Attrs) -> Result<NodeHandle, RuntimeError> {
        let (id, existing, parent, after) = {
            let mut st = self.shared.state.borrow_mut();
            let ComposerState { frames, groups, .. } = &mut *st;
            let frame = frames.last_mut().ok_or(RuntimeError::NotComposing {
                operation: "start_node",
            })?;
            let group = &groups[frame.group];
            if frame.node_open {
                return Err(RuntimeError::NodeMismatch {
                    group: group.label(),
                });
            }
            frame.node_open = true;
            let id = frame.group;
            let existing = group
                .node
                .as_ref()
                .map(|n| (n.handle, n.kind, n.attrs == attrs));
            let mut parent = None;
            let mut cursor = group.parent;
            while let Some(pid) = cursor {
                let Some(p) = groups.get(pid) else { break };
                if let Some(n) = &p.node {
                    parent = Some(n.handle);
                    break;
                }
                cursor = p.parent;
            }
            let after = match existing {
                Some((_, k, _)) if k == kind => None,
                _ => preceding_node(groups, frames, id),
            };
            (id, existing, parent, after)
        };

        let replaced = matches!(existing, Some((_, k, _)) if k != kind);
        let handle = {
            let mut renderer = self.shared.renderer.borrow_mut();
            match existing {
                Some((handle, k, true)) if k == kind => handle,
                Some((handle, k, false)) if k == kind => {
                    renderer.update(handle, &attrs);
                    handle
                }
                Some((handle, _, _)) => {
                    renderer.remove(handle);
                    renderer.create(parent, after, kind, &attrs)
                }
                None => renderer.create(parent, after, kind, &attrs),
            }
        };

        let mut st = self.shared.state.borrow_mut();
        let ComposerState { frames, groups, .. } = &mut *st;
        if replaced && let Some(frame) = frames.last() {
            // The old node took its subtree with it; descendants emit again.
            forget_nodes(groups, &frame.old_children);
        }
        if let Some(group) = groups.get_mut(id) {
            group.node = Some(NodeRecord {
                handle,
                kind,
                attrs,
            });
        }
        Ok(handle)
    }

    pub fn end_node(&self) -> Result<(), RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let ComposerState { frames, groups, .. } = &mut *st;
        let frame = frames.last_mut().ok_or(RuntimeError::NotComposing {
            operation: "end_node",
        })?;
        if !frame.node_open {
            return Err(RuntimeError::NodeMismatch {
                group: groups
                    .get(frame.group)
                    .map(Group::label)
                    .unwrap_or_default(),
            });
        }
        frame.node_open = false;
        Ok(())
    }

    pub(crate) fn launcher(&self) -> Rc<dyn Launcher> {
        self.shared.launcher.clone()
    }

    pub(crate) fn failure_sink(&self) -> FailureSink {
        self.shared.failures.clone()
    }

    pub(crate) fn current_label(&self) -> String {
        let st = self.shared.state.borrow();
        st.frames
            .last()
            .and_then(|f| st.groups.get(f.group))
            .map(Group::label)
            .unwrap_or_default()
    }

    /// Queues `run` for the commit phase of this pass.
    pub(crate) fn queue_effect(
        &self,
        kind: EffectKind,
        run: impl FnOnce() + 'static,
    ) -> Result<(), RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let group = st
            .frames
            .last()
            .map(|f| f.group)
            .ok_or(RuntimeError::NotComposing {
                operation: "queue_effect",
            })?;
        st.pending.push(PendingEffect {
            group,
            kind,
            run: Box::new(run),
        });
        Ok(())
    }

    fn depth(&self) -> usize {
        self.shared.state.borrow().frames.len()
    }

    fn start_group_at(
        &self,
        key: GroupKey,
        origin: &'static Location<'static>,
        flags: GroupFlags,
    ) -> Result<GroupId, RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let ComposerState {
            groups,
            frames,
            dirty,
            next_seq,
            ..
        } = &mut *st;
        let parent = frames.last_mut().ok_or(RuntimeError::NotComposing {
            operation: "start_group",
        })?;

        if !parent.seen_keys.insert(key) {
            if key.is_explicit() {
                log::warn!(
                    "duplicate explicit key among siblings at {}; their state may be swapped",
                    site(origin)
                );
            } else if self.shared.config.key_policy == KeyPolicy::RequireExplicitInLoops {
                return Err(RuntimeError::DuplicateKey {
                    group: site(origin),
                });
            } else {
                log::debug!("repeated call site {} matched by position", site(origin));
            }
        }

        let parent_id = parent.group;
        let depth = groups.get(parent_id).map_or(0, |g| g.depth + 1);
        let reuse = parent
            .old_children
            .iter()
            .zip(&parent.reused)
            .position(|(child, used)| !*used && groups.get(*child).is_some_and(|g| g.key == key));

        let (id, inserting, old_children) = match reuse {
            Some(i) => {
                parent.reused[i] = true;
                let id = parent.old_children[i];
                let children = std::mem::take(&mut groups[id].children);
                (id, false, children)
            }
            None => {
                *next_seq += 1;
                let id = groups.insert(Group::new(key, origin, Some(parent_id), depth, *next_seq));
                (id, true, Vec::new())
            }
        };

        let group = &mut groups[id];
        group.origin = origin;
        group.flags.insert(flags);
        group.flags.remove(GroupFlags::DIRTY);
        group.locals = locals::snapshot();
        dirty.remove(&id);
        frames.push(Frame::new(id, inserting, true, old_children));
        log::trace!(
            "{} group {}",
            if inserting { "inserting" } else { "updating" },
            site(origin)
        );
        Ok(id)
    }

    fn end_group_inner(&self) -> Result<(), RuntimeError> {
        let mut st = self.shared.state.borrow_mut();
        let frame = st.frames.pop().ok_or(RuntimeError::NotComposing {
            operation: "end_group",
        })?;
        Self::finish_frame(&mut st, frame)
    }

    /// Closes `frame`: unused previous children are queued for removal,
    /// the slot layout is validated and the group is attached to its parent.
    fn finish_frame(st: &mut ComposerState, frame: Frame) -> Result<(), RuntimeError> {
        let ComposerState {
            groups,
            frames,
            dirty,
            removed,
            ..
        } = st;

        for (child, used) in frame.old_children.iter().zip(&frame.reused) {
            if *used {
                continue;
            }
            if let Some(g) = groups.get_mut(*child) {
                g.flags.insert(GroupFlags::REMOVED);
            }
            dirty.remove(child);
            removed.push(*child);
        }

        if frame.attached
            && let Some(parent) = frames.last_mut()
        {
            parent.new_children.push(frame.group);
        }

        let group = &mut groups[frame.group];
        group.children = frame.new_children;

        if frame.node_open {
            return Err(RuntimeError::NodeMismatch {
                group: group.label(),
            });
        }
        if group.flags.contains(GroupFlags::COMPOSED) && frame.slot_cursor != group.slots.len() {
            return Err(RuntimeError::SlotCountMismatch {
                group: group.label(),
                expected: group.slots.len(),
                found: frame.slot_cursor,
            });
        }
        group.flags.insert(GroupFlags::COMPOSED);
        group.flags.remove(GroupFlags::FAILED);
        Ok(())
    }

    fn set_body(&self, id: GroupId, body: Rc<dyn Fn()>) {
        if let Some(group) = self.shared.state.borrow_mut().groups.get_mut(id) {
            group.body = Some(body);
        }
    }

    /// The group's read tracker, cleared of the previous execution's edges.
    fn prepare_tracker(&self, id: GroupId) -> Option<Rc<Tracker>> {
        let tracker = {
            let mut st = self.shared.state.borrow_mut();
            let group = st.groups.get_mut(id)?;
            match &group.tracker {
                Some(tracker) => tracker.clone(),
                None => {
                    let observer = Rc::new(GroupObserver {
                        group: id,
                        composer: Rc::downgrade(&self.shared),
                    });
                    let weak: Weak<dyn Observer> = Rc::downgrade(&observer) as Weak<dyn Observer>;
                    let tracker = Rc::new(Tracker::new(weak));
                    group.observer = Some(observer);
                    group.tracker = Some(tracker.clone());
                    tracker
                }
            }
        };
        tracker.reset();
        Some(tracker)
    }

    /// Runs `body` for the group on top of the stack and closes it. Failures
    /// are contained here: the group is flagged and the error recorded.
    fn run_body(&self, id: GroupId, depth: usize, body: &dyn Fn()) {
        let Some(tracker) = self.prepare_tracker(id) else {
            return;
        };
        let result = if self.shared.config.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(|| reactive::with_tracker(&tracker, body)))
                .map_err(|payload| RuntimeError::from_panic(payload, self.label_of(id)))
        } else {
            reactive::with_tracker(&tracker, body);
            Ok(())
        };
        let result = result.and_then(|()| self.end_group_inner());
        if let Err(error) = result {
            self.abandon(depth, id, error);
        }
    }

    /// Unwinds frames above `depth` after a failure in `id`. Children that
    /// were not reached are kept so the tree stays intact for the next try.
    fn abandon(&self, depth: usize, id: GroupId, error: RuntimeError) {
        {
            let mut st = self.shared.state.borrow_mut();
            while st.frames.len() > depth {
                let Some(frame) = st.frames.pop() else { break };
                let ComposerState { groups, frames, .. } = &mut *st;
                let mut children = frame.new_children;
                children.extend(
                    frame
                        .old_children
                        .iter()
                        .zip(&frame.reused)
                        .filter(|(_, used)| !**used)
                        .map(|(child, _)| *child),
                );
                if let Some(g) = groups.get_mut(frame.group) {
                    g.children = children;
                    g.flags.insert(GroupFlags::FAILED);
                }
                if frame.attached
                    && let Some(parent) = frames.last_mut()
                {
                    parent.new_children.push(frame.group);
                }
            }
            if let Some(g) = st.groups.get_mut(id) {
                g.flags.insert(GroupFlags::FAILED);
            }
            st.errors.push(error.clone());
        }
        log::error!("composition of {} failed: {error}", self.label_of(id));
    }

    fn label_of(&self, id: GroupId) -> String {
        self.shared
            .state
            .borrow()
            .groups
            .get(id)
            .map(Group::label)
            .unwrap_or_default()
    }

    /// Re-invokes a dirty restartable group in place.
    fn restart(&self, id: GroupId) -> bool {
        let entered = {
            let mut st = self.shared.state.borrow_mut();
            let depth = st.frames.len();
            let ComposerState {
                groups,
                frames,
                dirty,
                ..
            } = &mut *st;
            dirty.remove(&id);
            match groups.get_mut(id) {
                Some(g) if !g.flags.contains(GroupFlags::REMOVED) => {
                    g.flags.remove(GroupFlags::DIRTY);
                    g.body.clone().map(|body| {
                        let old_children = std::mem::take(&mut g.children);
                        frames.push(Frame::new(id, false, false, old_children));
                        (body, g.locals.clone(), depth)
                    })
                }
                _ => None,
            }
        };
        let Some((body, snapshot, depth)) = entered else {
            return false;
        };
        let _locals = locals::enter(snapshot);
        self.run_body(id, depth, &*body);
        true
    }
}

/// The last node emitted before `id` under its nearest node ancestor.
///
/// Open ancestors have their children in their frame's `new_children`; the
/// rest of the tree keeps them in `Group::children`.
fn preceding_node(
    groups: &SlotMap<GroupId, Group>,
    frames: &[Frame],
    id: GroupId,
) -> Option<NodeHandle> {
    let mut cursor = id;
    loop {
        let parent = groups.get(cursor)?.parent?;
        let earlier: &[GroupId] = match frames.iter().rev().find(|f| f.group == parent) {
            Some(frame) => &frame.new_children,
            None => {
                let siblings = &groups.get(parent)?.children;
                let end = siblings.iter().position(|c| *c == cursor).unwrap_or(0);
                &siblings[..end]
            }
        };
        if let Some(handle) = earlier.iter().rev().find_map(|c| last_node(groups, *c)) {
            return Some(handle);
        }
        if groups.get(parent)?.node.is_some() {
            return None;
        }
        cursor = parent;
    }
}

fn last_node(groups: &SlotMap<GroupId, Group>, id: GroupId) -> Option<NodeHandle> {
    let group = groups.get(id)?;
    match &group.node {
        Some(node) => Some(node.handle),
        None => group
            .children
            .iter()
            .rev()
            .find_map(|c| last_node(groups, *c)),
    }
}

fn forget_nodes(groups: &mut SlotMap<GroupId, Group>, ids: &[GroupId]) {
    for id in ids {
        let Some(group) = groups.get_mut(*id) else {
            continue;
        };
        group.node = None;
        let children = group.children.clone();
        forget_nodes(groups, &children);
    }
}

/// Summary of one composition or recomposition pass.
#[derive(Debug, Default)]
pub struct RecomposeReport {
    /// Restartable groups re-invoked directly by the pass.
    pub recomposed: usize,
    pub effects_run: usize,
    /// Groups that failed; their subtrees were left as they were.
    pub errors: Vec<RuntimeError>,
}

impl RecomposeReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first group failure, if any.
    pub fn into_result(self) -> Result<Self, RuntimeError> {
        match self.errors.first() {
            Some(err) => Err(err.clone()),
            None => Ok(self),
        }
    }

    fn merge(&mut self, other: RecomposeReport) {
        self.recomposed += other.recomposed;
        self.effects_run += other.effects_run;
        self.errors.extend(other.errors);
    }
}

/// One composition tree: its group tree, slot table, renderer and effects.
///
/// Compositions are single-threaded. Independent compositions may run on
/// separate threads, each with its own composer and locals stack.
pub struct Composition {
    shared: Rc<ComposerShared>,
}

impl Composition {
    pub fn new(renderer: impl Renderer + 'static, launcher: impl Launcher + 'static) -> Self {
        Self::with_config(renderer, launcher, CompositionConfig::default())
    }

    pub fn with_config(
        renderer: impl Renderer + 'static,
        launcher: impl Launcher + 'static,
        config: CompositionConfig,
    ) -> Self {
        Self {
            shared: Rc::new(ComposerShared {
                state: RefCell::new(ComposerState::default()),
                renderer: RefCell::new(Box::new(renderer)),
                launcher: Rc::new(launcher),
                on_invalidate: RefCell::new(None),
                failures: FailureSink::default(),
                config,
            }),
        }
    }

    /// Host hook called once per batch of invalidations, i.e. when the first
    /// group becomes dirty after a pass. Hosts schedule `recompose` from it.
    pub fn on_invalidate(&self, f: impl Fn() + 'static) {
        *self.shared.on_invalidate.borrow_mut() = Some(Rc::new(f));
    }

    /// Composes `content` as the root, replacing any previous content.
    #[track_caller]
    pub fn set_content(&self, content: impl Fn() + 'static) -> Result<RecomposeReport, RuntimeError> {
        let origin = Location::caller();
        let body: Rc<dyn Fn()> = Rc::new(content);
        let root = {
            let mut st = self.shared.state.borrow_mut();
            if st.disposed {
                return Err(RuntimeError::Disposed);
            }
            if let Some(old) = st.root.take() {
                if let Some(g) = st.groups.get_mut(old) {
                    g.flags.insert(GroupFlags::REMOVED);
                }
                st.removed.push(old);
            }
            st.next_seq += 1;
            let seq = st.next_seq;
            let mut group = Group::new(GroupKey::at(origin), origin, None, 0, seq);
            group.flags.insert(GroupFlags::RESTARTABLE);
            group.body = Some(body.clone());
            group.locals = locals::snapshot();
            let root = st.groups.insert(group);
            st.root = Some(root);
            st.frames.push(Frame::new(root, true, false, Vec::new()));
            root
        };

        {
            let _pass = PassGuard::enter(&self.shared);
            let composer = Composer {
                shared: self.shared.clone(),
            };
            composer.run_body(root, 0, &*body);
        }
        log::debug!("composed content from {}", site(origin));
        Ok(self.finish_pass(0))
    }

    /// Re-invokes the groups invalidated since the last pass, parents before
    /// children, then runs the commit phase.
    pub fn recompose(&self) -> Result<RecomposeReport, RuntimeError> {
        let order = {
            let st = self.shared.state.borrow();
            if st.disposed {
                return Err(RuntimeError::Disposed);
            }
            let mut order: Vec<(u32, u64, GroupId)> = st
                .dirty
                .iter()
                .filter_map(|id| st.groups.get(*id).map(|g| (g.depth, g.seq, *id)))
                .collect();
            order.sort_unstable();
            order
        };
        if order.is_empty() {
            return Ok(RecomposeReport::default());
        }

        let mut restarted = 0;
        {
            let _pass = PassGuard::enter(&self.shared);
            let composer = Composer {
                shared: self.shared.clone(),
            };
            for (_, _, id) in order {
                // Already re-run as part of an ancestor in this pass.
                if !self.shared.state.borrow().dirty.contains(&id) {
                    continue;
                }
                if composer.restart(id) {
                    restarted += 1;
                }
            }
        }
        log::debug!("recomposed {restarted} groups");
        Ok(self.finish_pass(restarted))
    }

    /// Recomposes until no group is dirty.
    pub fn run_until_idle(&self) -> Result<RecomposeReport, RuntimeError> {
        let mut report = RecomposeReport::default();
        let mut passes = 0;
        while self.has_pending_changes() {
            if passes == self.shared.config.max_settle_passes {
                log::warn!(
                    "gave up settling after {passes} passes ({} groups recomposed, {} effects run)",
                    report.recomposed,
                    report.effects_run
                );
                for error in &report.errors {
                    log::error!("unsettled pass failure: {error}");
                }
                return Err(RuntimeError::Unsettled {
                    passes,
                    errors: report.errors,
                });
            }
            passes += 1;
            report.merge(self.recompose()?);
        }
        Ok(report)
    }

    fn finish_pass(&self, restarted: usize) -> RecomposeReport {
        let effects_run = self.shared.commit();
        let (errors, request_frame) = {
            let mut st = self.shared.state.borrow_mut();
            st.recomposed += restarted;
            let request = !st.dirty.is_empty() && !st.frame_requested;
            st.frame_requested |= request;
            (std::mem::take(&mut st.errors), request)
        };
        if request_frame {
            self.shared.request_frame();
        }
        RecomposeReport {
            recomposed: restarted,
            effects_run,
            errors,
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.shared.state.borrow().dirty.is_empty()
    }

    /// Restartable groups re-invoked over the composition's lifetime.
    pub fn total_recompositions(&self) -> usize {
        self.shared.state.borrow().recomposed
    }

    pub fn group_count(&self) -> usize {
        self.shared.state.borrow().groups.len()
    }

    pub fn take_effect_failures(&self) -> Vec<EffectFailure> {
        self.shared.failures.take()
    }

    #[cfg(test)]
    pub(crate) fn disposable_count(&self) -> usize {
        let st = self.shared.state.borrow();
        st.groups.values().map(|g| g.disposables.len()).sum()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.borrow().disposed
    }

    /// Tears the whole tree down: every disposable runs once, launched
    /// effects are cancelled and renderer nodes are removed.
    pub fn dispose(&self) {
        let (root, removed) = {
            let mut st = self.shared.state.borrow_mut();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.pending.clear();
            st.dirty.clear();
            (st.root.take(), std::mem::take(&mut st.removed))
        };
        for id in removed.into_iter().chain(root) {
            self.shared.dispose_subtree(id, true);
        }
        log::debug!("composition disposed");
    }
}

impl Drop for Composition {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Slot-based remember: the Nth call in a group always refers to the Nth
/// stored value.
pub fn remember<T: Clone + 'static>(init: impl FnOnce() -> T) -> T {
    composer_for("remember")
        .remember_slot(init)
        .unwrap_or_else(|e| e.raise())
}

/// Like [`remember`], but recomputes when `key` differs from the key stored
/// with the value.
pub fn remember_keyed<K, T>(key: K, init: impl FnOnce() -> T) -> T
where
    K: PartialEq + Clone + 'static,
    T: Clone + 'static,
{
    let composer = composer_for("remember_keyed");
    let result = (|| -> Result<T, RuntimeError> {
        let index = composer.next_slot()?;
        if let Some((stored, v)) = composer.get_slot::<(K, T)>(index)?
            && stored == key
        {
            return Ok(v);
        }
        let v = init();
        composer.set_slot(index, (key, v.clone()))?;
        Ok(v)
    })();
    result.unwrap_or_else(|e| e.raise())
}

/// See [`Composer::changed`].
pub fn changed<T: PartialEq + Clone + 'static>(value: &T) -> bool {
    composer_for("changed")
        .changed(value)
        .unwrap_or_else(|e| e.raise())
}

/// A restartable group: reads made by `body` are tracked, and a write to any
/// of them re-invokes `body` alone on the next pass.
#[track_caller]
pub fn restartable(body: impl Fn() + 'static) {
    let origin = Location::caller();
    restartable_at(GroupKey::at(origin), origin, Rc::new(body));
}

/// [`restartable`] with an explicit key, for loops and reorderable lists.
#[track_caller]
pub fn restartable_keyed<K: Hash>(key: K, body: impl Fn() + 'static) {
    let origin = Location::caller();
    restartable_at(GroupKey::keyed(origin, &key), origin, Rc::new(body));
}

fn restartable_at(key: GroupKey, origin: &'static Location<'static>, body: Rc<dyn Fn()>) {
    let composer = composer_for("restartable");
    let depth = composer.depth();
    let id = composer
        .start_group_at(key, origin, GroupFlags::RESTARTABLE)
        .unwrap_or_else(|e| e.raise());
    composer.set_body(id, body.clone());
    composer.run_body(id, depth, &*body);
}

/// A non-restartable group giving `content` its own slot region.
#[track_caller]
pub fn group<R>(content: impl FnOnce() -> R) -> R {
    let origin = Location::caller();
    grouped(GroupKey::at(origin), origin, content)
}

/// [`group`] with an explicit key. Use it around conditional branches and
/// loop items so their remembered state follows the key.
#[track_caller]
pub fn keyed<K: Hash, R>(key: K, content: impl FnOnce() -> R) -> R {
    let origin = Location::caller();
    grouped(GroupKey::keyed(origin, &key), origin, content)
}

fn grouped<R>(key: GroupKey, origin: &'static Location<'static>, content: impl FnOnce() -> R) -> R {
    let composer = composer_for("group");
    composer
        .start_group_at(key, origin, GroupFlags::empty())
        .unwrap_or_else(|e| e.raise());
    let out = content();
    composer.end_group_inner().unwrap_or_else(|e| e.raise());
    out
}

/// A group that emits a renderer node; nodes emitted by `content` become its
/// children.
#[track_caller]
pub fn node(kind: &'static str, attrs: Attrs, content: impl FnOnce()) -> NodeHandle {
    let origin = Location::caller();
    let composer = composer_for("node");
    let result = (|| -> Result<NodeHandle, RuntimeError> {
        composer.start_group_at(GroupKey::at(origin), origin, GroupFlags::empty())?;
        let handle = composer.start_node(kind, attrs)?;
        content();
        composer.end_node()?;
        composer.end_group_inner()?;
        Ok(handle)
    })();
    result.unwrap_or_else(|e| e.raise())
}
