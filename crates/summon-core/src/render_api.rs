use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use slotmap::{Key, KeyData, SlotMap};
use smallvec::SmallVec;

/// Opaque handle to a node materialised by a [`Renderer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

/// Ordered node attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attrs(SmallVec<[(Cow<'static, str>, String); 4]>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<Cow<'static, str>>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<Cow<'static, str>>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_ref(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Platform side of node emission.
///
/// `create` is called when a node group is first composed, `update` when its
/// attributes change on recomposition, and `remove` once for the top-most
/// node of a subtree leaving the composition.
///
/// A created node goes right after its sibling `after`, or first under
/// `parent` when `after` is `None`. Siblings that are about to be removed may
/// still be present when `create` runs.
pub trait Renderer {
    fn create(
        &mut self,
        parent: Option<NodeHandle>,
        after: Option<NodeHandle>,
        kind: &'static str,
        attrs: &Attrs,
    ) -> NodeHandle;
    fn update(&mut self, node: NodeHandle, attrs: &Attrs);
    fn remove(&mut self, node: NodeHandle);
}

slotmap::new_key_type! {
    struct NodeKey;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderOp {
    Create { kind: &'static str },
    Update { kind: &'static str },
    Remove { kind: &'static str },
}

struct RecordedNode {
    kind: &'static str,
    attrs: Attrs,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
}

#[derive(Default)]
struct RecordedTree {
    nodes: SlotMap<NodeKey, RecordedNode>,
    roots: Vec<NodeKey>,
    ops: Vec<RenderOp>,
}

impl RecordedTree {
    fn detach(&mut self, key: NodeKey) {
        let parent = self.nodes.get(key).and_then(|n| n.parent);
        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(p) => p.children.retain(|c| *c != key),
            None => self.roots.retain(|c| *c != key),
        }
    }

    fn drop_subtree(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.remove(key) {
            for child in node.children {
                self.drop_subtree(child);
            }
        }
    }

    fn dump_node(&self, key: NodeKey, depth: usize, out: &mut String) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        let _ = write!(out, "{}{}", "  ".repeat(depth), node.kind);
        for (name, value) in node.attrs.iter() {
            let _ = write!(out, " {name}={value:?}");
        }
        out.push('\n');
        for child in &node.children {
            self.dump_node(*child, depth + 1, out);
        }
    }
}

/// In-memory renderer that keeps the emitted tree and a log of operations.
///
/// Cloning shares the tree, so a host (or a test) can keep a handle while the
/// composition owns another.
#[derive(Clone, Default)]
pub struct RecordingRenderer(Rc<RefCell<RecordedTree>>);

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.0.borrow().nodes.len()
    }

    pub fn ops(&self) -> Vec<RenderOp> {
        self.0.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.0.borrow_mut().ops.clear();
    }

    /// Indented text form of the tree, one node per line.
    pub fn dump(&self) -> String {
        let tree = self.0.borrow();
        let mut out = String::new();
        for root in &tree.roots {
            tree.dump_node(*root, 0, &mut out);
        }
        out
    }
}

fn to_key(handle: NodeHandle) -> NodeKey {
    NodeKey::from(KeyData::from_ffi(handle.0))
}

impl Renderer for RecordingRenderer {
    fn create(
        &mut self,
        parent: Option<NodeHandle>,
        after: Option<NodeHandle>,
        kind: &'static str,
        attrs: &Attrs,
    ) -> NodeHandle {
        let mut guard = self.0.borrow_mut();
        let tree = &mut *guard;
        let parent = parent.map(to_key).filter(|p| tree.nodes.contains_key(*p));
        let key = tree.nodes.insert(RecordedNode {
            kind,
            attrs: attrs.clone(),
            parent,
            children: Vec::new(),
        });
        let siblings = match parent.and_then(|p| tree.nodes.get_mut(p)) {
            Some(p) => &mut p.children,
            None => &mut tree.roots,
        };
        let index = match after.map(to_key) {
            None => 0,
            Some(anchor) => match siblings.iter().position(|c| *c == anchor) {
                Some(i) => i + 1,
                None => {
                    log::warn!("create after unknown sibling {after:?}; appending");
                    siblings.len()
                }
            },
        };
        siblings.insert(index, key);
        tree.ops.push(RenderOp::Create { kind });
        NodeHandle(key.data().as_ffi())
    }

    fn update(&mut self, node: NodeHandle, attrs: &Attrs) {
        let mut tree = self.0.borrow_mut();
        let Some(n) = tree.nodes.get_mut(to_key(node)) else {
            log::warn!("update of unknown node {node:?}");
            return;
        };
        n.attrs = attrs.clone();
        let kind = n.kind;
        tree.ops.push(RenderOp::Update { kind });
    }

    fn remove(&mut self, node: NodeHandle) {
        let mut tree = self.0.borrow_mut();
        let key = to_key(node);
        let Some(kind) = tree.nodes.get(key).map(|n| n.kind) else {
            log::warn!("removal of unknown node {node:?}");
            return;
        };
        tree.detach(key);
        tree.drop_subtree(key);
        tree.ops.push(RenderOp::Remove { kind });
    }
}
