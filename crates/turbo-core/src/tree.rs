//! Index of materialized paths.
//!
//! Nodes live in a slot arena and link to each other by [`NodeId`]. Every
//! non-root node points at its nearest materialized ancestor, so inserting
//! `/a/b/c/d` before `/a/b/c` still ends with `d` under `c`.

use std::collections::{HashMap, HashSet};

use crate::path;

/// Handle to a node. Stale after the node is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
pub struct Node<T> {
    path: String,
    depth: usize,
    parent: Option<NodeId>,
    children: HashSet<NodeId>,
    pub data: T,
}

impl<T> Node<T> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().copied()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

#[derive(Debug)]
pub struct PathTree<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    index: HashMap<String, NodeId>,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.index.get(path::ROOT).copied()
    }

    /// Look up the node for `path`. Never mutates.
    pub fn get(&self, path: &str) -> Option<NodeId> {
        match self.index.get(path) {
            Some(id) => Some(*id),
            None => self.index.get(&path::canonicalize(path)).copied(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Children of the node at `path`, `None` when absent or childless.
    pub fn children(&self, path: &str) -> Option<Vec<NodeId>> {
        let node = self.node(self.get(path)?)?;
        if node.children.is_empty() {
            None
        } else {
            Some(node.children().collect())
        }
    }

    /// True when the node's tree parent is its direct path parent, i.e. no
    /// unmaterialized levels sit between them.
    pub fn has_immediate_parent(&self, id: NodeId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        let Some(parent) = node.parent.and_then(|p| self.node(p)) else {
            return false;
        };
        path::parent_of(&node.path) == Some(parent.path.as_str())
    }

    /// Detach `id` after handing its children to its own parent.
    ///
    /// The root can only be removed once it has no children.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let node = self.node(id)?;
        let children: Vec<NodeId> = node.children().collect();
        let parent = node.parent;
        match parent {
            Some(parent) => {
                for child in &children {
                    if let Some(c) = self.node_mut(*child) {
                        c.parent = Some(parent);
                    }
                }
                if let Some(p) = self.node_mut(parent) {
                    p.children.extend(children.iter().copied());
                }
                if let Some(n) = self.node_mut(id) {
                    n.children.clear();
                }
            }
            None if !children.is_empty() => return None,
            None => {}
        }
        self.destroy(id)
    }

    /// Detach `id` from its parent and the path index. Children are not
    /// touched; inside a cascade they have already been destroyed.
    pub fn destroy(&mut self, id: NodeId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.index.remove(&node.path);
        if let Some(parent) = node.parent.and_then(|p| self.node_mut(p)) {
            parent.children.remove(&id);
        }
        Some(node.data)
    }

    /// Node ids of the subtree under `id`, every node after all of its
    /// descendants.
    pub fn postorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(node) = self.node(current) {
                stack.extend(node.children().map(|child| (child, false)));
            }
        }
        out
    }

    /// Visit every descendant of `id`, then `id` itself.
    pub fn cascade(&self, id: NodeId, mut visit: impl FnMut(NodeId, &Node<T>)) {
        for current in self.postorder(id) {
            if let Some(node) = self.node(current) {
                visit(current, node);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node<T>)> + '_ {
        self.index
            .values()
            .filter_map(|id| self.node(*id).map(|node| (*id, node)))
    }

    fn nearest_ancestor(&self, path: &str) -> Option<NodeId> {
        path::ancestors(path).find_map(|p| self.index.get(p).copied())
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId { index, generation: 0 }
            }
        }
    }
}

impl<T: Default> PathTree<T> {
    /// Materialize `path`, creating the root and re-homing existing
    /// descendants as needed. Returns the existing node when present.
    pub fn put(&mut self, path: &str) -> NodeId {
        let path = path::canonicalize(path);
        if let Some(id) = self.index.get(&path) {
            return *id;
        }

        let parent = if path == path::ROOT {
            None
        } else {
            Some(match self.nearest_ancestor(&path) {
                Some(id) => id,
                None => self.put(path::ROOT),
            })
        };

        let id = self.alloc(Node {
            depth: path::depth(&path),
            path: path.clone(),
            parent,
            children: HashSet::new(),
            data: T::default(),
        });
        self.index.insert(path.clone(), id);

        let Some(parent) = parent else {
            return id;
        };

        // Only the nearest ancestor's children can belong under the new node.
        let moved: Vec<NodeId> = self
            .node(parent)
            .map(|p| {
                p.children()
                    .filter(|c| {
                        self.node(*c)
                            .is_some_and(|child| path::is_ancestor(&path, &child.path))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(p) = self.node_mut(parent) {
            for child in &moved {
                p.children.remove(child);
            }
            p.children.insert(id);
        }
        for child in &moved {
            if let Some(c) = self.node_mut(*child) {
                c.parent = Some(id);
            }
        }
        if let Some(n) = self.node_mut(id) {
            n.children.extend(moved);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parent_path(tree: &PathTree<()>, path: &str) -> Option<String> {
        let id = tree.get(path)?;
        let parent = tree.node(id)?.parent()?;
        Some(tree.node(parent)?.path().to_string())
    }

    /// Every non-root node hangs off its longest materialized strict ancestor
    /// and reaches the root through parent links.
    fn assert_well_formed(tree: &PathTree<()>) {
        for (id, node) in tree.iter() {
            if node.path() == path::ROOT {
                assert!(node.parent().is_none());
                continue;
            }
            let expected = path::ancestors(node.path())
                .find(|p| tree.get(p).is_some())
                .map(str::to_string);
            let actual = node.parent().and_then(|p| tree.node(p)).map(|p| p.path().to_string());
            assert_eq!(actual, expected, "wrong parent for {}", node.path());

            let parent = node.parent().and_then(|p| tree.node(p)).unwrap();
            assert!(parent.children().any(|c| c == id), "{} missing from parent", node.path());

            let mut hops = 0;
            let mut cursor = node.parent();
            while let Some(p) = cursor {
                hops += 1;
                assert!(hops <= tree.len(), "cycle at {}", node.path());
                cursor = tree.node(p).unwrap().parent();
            }
        }
    }

    #[test]
    fn put_creates_root() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a");
        assert!(tree.root().is_some());
        assert_eq!(parent_path(&tree, "/a").as_deref(), Some("/"));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn put_is_idempotent() {
        let mut tree: PathTree<()> = PathTree::new();
        let a = tree.put("/a/b");
        let b = tree.put("a/b/");
        assert_eq!(a, b);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn put_rehomes_out_of_order_descendants() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a/b/c/d");
        tree.put("/a/b/x");
        assert_eq!(parent_path(&tree, "/a/b/c/d").as_deref(), Some("/"));

        tree.put("/a/b/c");
        assert_eq!(parent_path(&tree, "/a/b/c/d").as_deref(), Some("/a/b/c"));
        assert_eq!(parent_path(&tree, "/a/b/c").as_deref(), Some("/"));

        tree.put("/a");
        assert_eq!(parent_path(&tree, "/a/b/c").as_deref(), Some("/a"));
        assert_eq!(parent_path(&tree, "/a/b/x").as_deref(), Some("/a"));
        assert_well_formed(&tree);
    }

    #[test]
    fn sibling_prefix_is_not_a_descendant() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/ab/c");
        tree.put("/a");
        assert_eq!(parent_path(&tree, "/ab/c").as_deref(), Some("/"));
    }

    #[test]
    fn children_absent_when_empty() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a");
        assert!(tree.children("/a").is_none());
        assert!(tree.children("/missing").is_none());
        assert_eq!(tree.children("/").map(|c| c.len()), Some(1));
    }

    #[test]
    fn remove_reparents_children() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a");
        tree.put("/a/b");
        tree.put("/a/c");
        let a = tree.get("/a").unwrap();
        tree.remove(a);

        assert!(tree.get("/a").is_none());
        assert_eq!(parent_path(&tree, "/a/b").as_deref(), Some("/"));
        assert_eq!(parent_path(&tree, "/a/c").as_deref(), Some("/"));
        assert!(!tree.contains(a));
        assert_well_formed(&tree);
    }

    #[test]
    fn remove_root_with_children_is_refused() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a");
        let root = tree.root().unwrap();
        assert!(tree.remove(root).is_none());
        assert!(tree.contains(root));
    }

    #[test]
    fn destroy_detaches_from_parent() {
        let mut tree: PathTree<()> = PathTree::new();
        tree.put("/a/b");
        let b = tree.get("/a/b").unwrap();
        tree.destroy(b);
        assert!(tree.get("/a/b").is_none());
        assert!(tree.children("/").is_none());
    }

    #[test]
    fn stale_ids_do_not_resolve_after_slot_reuse() {
        let mut tree: PathTree<()> = PathTree::new();
        let a = tree.put("/a");
        tree.destroy(a);
        let b = tree.put("/b");
        assert!(tree.node(a).is_none());
        assert_eq!(tree.node(b).unwrap().path(), "/b");
    }

    #[test]
    fn immediate_parent_detection() {
        let mut tree: PathTree<()> = PathTree::new();
        let skip = tree.put("/a/b/c");
        let direct = tree.put("/x");
        assert!(!tree.has_immediate_parent(skip));
        assert!(tree.has_immediate_parent(direct));
        tree.put("/a/b");
        assert!(tree.has_immediate_parent(skip));
        assert!(!tree.has_immediate_parent(tree.root().unwrap()));
    }

    #[test]
    fn cascade_is_postorder() {
        let mut tree: PathTree<()> = PathTree::new();
        for p in ["/a", "/a/b", "/a/b/c", "/a/b/c/1", "/a/d"] {
            tree.put(p);
        }
        let mut seen = Vec::new();
        tree.cascade(tree.get("/a").unwrap(), |_, node| seen.push(node.path().to_string()));

        let pos = |p: &str| seen.iter().position(|s| s == p).unwrap();
        assert_eq!(seen.len(), 5);
        assert!(pos("/a/b/c/1") < pos("/a/b/c"));
        assert!(pos("/a/b/c") < pos("/a/b"));
        assert!(pos("/a/b") < pos("/a"));
        assert!(pos("/a/d") < pos("/a"));
        assert_eq!(seen.last().map(String::as_str), Some("/a"));
    }

    fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..5)
            .prop_map(|segments| path::canonicalize(&segments.join("/")))
    }

    proptest! {
        #[test]
        fn any_insertion_order_is_well_formed(paths in prop::collection::vec(arb_path(), 1..40)) {
            let mut tree: PathTree<()> = PathTree::new();
            for p in &paths {
                tree.put(p);
            }
            assert_well_formed(&tree);
            for p in &paths {
                prop_assert!(tree.get(p).is_some());
            }
        }

        #[test]
        fn removals_keep_tree_connected(
            paths in prop::collection::vec(arb_path(), 1..40),
            drop_every in 2usize..5,
        ) {
            let mut tree: PathTree<()> = PathTree::new();
            for p in &paths {
                tree.put(p);
            }
            for p in paths.iter().step_by(drop_every) {
                if p == path::ROOT {
                    continue;
                }
                if let Some(id) = tree.get(p) {
                    tree.remove(id);
                }
            }
            assert_well_formed(&tree);
        }

        #[test]
        fn cascade_visits_descendants_first(paths in prop::collection::vec(arb_path(), 1..40)) {
            let mut tree: PathTree<()> = PathTree::new();
            for p in &paths {
                tree.put(p);
            }
            let root = tree.root().unwrap();
            let order = tree.postorder(root);
            prop_assert_eq!(order.len(), tree.len());
            for (i, id) in order.iter().enumerate() {
                let node = tree.node(*id).unwrap();
                for (j, other) in order.iter().enumerate() {
                    let other_path = tree.node(*other).unwrap().path();
                    if path::is_ancestor(node.path(), other_path) {
                        prop_assert!(j < i, "{} visited after ancestor {}", other_path, node.path());
                    }
                }
            }
        }
    }
}
