use std::collections::{BTreeSet, HashMap};

use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::{NodeId, ProjectId};
use crate::scene::node::{DataNode, Lifecycle, NodePatch, NodeProps, SceneNode};

#[derive(Debug, Clone)]
struct IndexedNode {
    props: NodeProps,
    children: Vec<NodeId>,
    lifecycle: Lifecycle,
}

/// In-memory store of every scene tree the engine holds.
///
/// Keeps the flat node records plus three auxiliary maps: node to parent,
/// node to owning project, and project to node set. Structural operations
/// mutate this index synchronously; persistence happens after the fact and
/// is never reflected back here.
///
/// Removal tombstones instead of deleting (see [`Lifecycle`]); tombstoned
/// nodes stay indexed under their project until [`NodeIndex::reap`] runs.
#[derive(Debug, Default)]
pub(crate) struct NodeIndex {
    nodes: HashMap<NodeId, IndexedNode>,
    parents: HashMap<NodeId, NodeId>,
    owners: HashMap<NodeId, ProjectId>,
    by_project: HashMap<ProjectId, BTreeSet<NodeId>>,
    roots: HashMap<ProjectId, NodeId>,
}

impl NodeIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn index_record(
        &mut self,
        project: &ProjectId,
        id: NodeId,
        props: NodeProps,
        children: Vec<NodeId>,
    ) {
        self.nodes.insert(
            id.clone(),
            IndexedNode {
                props,
                children,
                lifecycle: Lifecycle::Active,
            },
        );
        self.owners.insert(id.clone(), project.clone());
        self.by_project.entry(project.clone()).or_default().insert(id);
    }

    /// Insert a single childless node under `parent` at `index` (end when
    /// absent). No parent establishes (or replaces) the project root.
    pub(crate) fn insert(
        &mut self,
        project: &ProjectId,
        id: NodeId,
        props: NodeProps,
        parent: Option<&NodeId>,
        index: Option<usize>,
    ) -> LivecompResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(LivecompError::validation(format!(
                "node '{id}' is already indexed"
            )));
        }
        match parent {
            Some(parent_id) => {
                let parent_rec = self
                    .nodes
                    .get_mut(parent_id)
                    .filter(|n| n.lifecycle.is_active())
                    .ok_or_else(|| LivecompError::ParentNotFound(parent_id.to_string()))?;
                let at = index
                    .unwrap_or(parent_rec.children.len())
                    .min(parent_rec.children.len());
                parent_rec.children.insert(at, id.clone());
                self.parents.insert(id.clone(), parent_id.clone());
            }
            None => {
                // Root insertion. A replaced root is tombstoned (its
                // subtree still attached beneath it) and stays reachable
                // by id until reaped.
                self.replace_root(project, id.clone());
            }
        }
        self.index_record(project, id, props, Vec::new());
        Ok(())
    }

    /// Index a pre-built tree by recursive traversal, as a root when
    /// `parent` is absent.
    pub(crate) fn adopt_tree(
        &mut self,
        project: &ProjectId,
        tree: &SceneNode,
        parent: Option<&NodeId>,
    ) -> LivecompResult<()> {
        if self.nodes.contains_key(&tree.id) {
            return Err(LivecompError::validation(format!(
                "node '{}' is already indexed",
                tree.id
            )));
        }
        match parent {
            Some(parent_id) => {
                self.parents.insert(tree.id.clone(), parent_id.clone());
            }
            None => {
                self.replace_root(project, tree.id.clone());
            }
        }
        let child_ids: Vec<NodeId> = tree.children.iter().map(|c| c.id.clone()).collect();
        self.index_record(project, tree.id.clone(), tree.props.clone(), child_ids);
        for child in &tree.children {
            self.adopt_tree(project, child, Some(&tree.id))?;
        }
        Ok(())
    }

    fn replace_root(&mut self, project: &ProjectId, id: NodeId) {
        if let Some(old_root) = self.roots.insert(project.clone(), id) {
            if let Some(rec) = self.nodes.get_mut(&old_root) {
                rec.lifecycle = Lifecycle::Tombstoned;
            }
        }
    }

    /// Shallow-merge a patch into a node's props. Children untouched.
    pub(crate) fn update(&mut self, id: &NodeId, patch: NodePatch) -> LivecompResult<()> {
        let rec = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| LivecompError::validation(format!("unknown node '{id}'")))?;
        rec.props.merge(patch);
        Ok(())
    }

    /// Detach a node from its parent and tombstone it. Returns the old
    /// parent id, if any. The node's subtree stays attached beneath it.
    pub(crate) fn detach(&mut self, id: &NodeId) -> LivecompResult<Option<NodeId>> {
        if !self.nodes.contains_key(id) {
            return Err(LivecompError::validation(format!("unknown node '{id}'")));
        }
        let parent = self.parents.remove(id);
        if let Some(parent_id) = &parent {
            if let Some(parent_rec) = self.nodes.get_mut(parent_id) {
                parent_rec.children.retain(|c| c != id);
            }
        } else if let Some(project) = self.owners.get(id) {
            if self.roots.get(project) == Some(id) {
                self.roots.remove(&project.clone());
            }
        }
        if let Some(rec) = self.nodes.get_mut(id) {
            rec.lifecycle = Lifecycle::Tombstoned;
        }
        Ok(parent)
    }

    /// Re-sequence a parent's children to match `order` exactly.
    ///
    /// Fail-fast: if the supplied set differs from the existing set the
    /// children are left untouched and a validation error is returned.
    pub(crate) fn reorder(&mut self, parent: &NodeId, order: &[NodeId]) -> LivecompResult<()> {
        let rec = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| LivecompError::ParentNotFound(parent.to_string()))?;
        let mut want: Vec<&NodeId> = order.iter().collect();
        let mut have: Vec<&NodeId> = rec.children.iter().collect();
        want.sort();
        have.sort();
        if want != have {
            return Err(LivecompError::validation(format!(
                "reorder set does not match children of '{parent}'"
            )));
        }
        rec.children = order.to_vec();
        Ok(())
    }

    /// Move a node under a new parent at `index` (end when absent).
    ///
    /// Moving a node into its own descendant is not validated here; that is
    /// the caller's responsibility.
    pub(crate) fn move_node(
        &mut self,
        id: &NodeId,
        new_parent: &NodeId,
        index: Option<usize>,
    ) -> LivecompResult<()> {
        if !self.nodes.contains_key(id) {
            return Err(LivecompError::validation(format!("unknown node '{id}'")));
        }
        if !self
            .nodes
            .get(new_parent)
            .is_some_and(|n| n.lifecycle.is_active())
        {
            return Err(LivecompError::ParentNotFound(new_parent.to_string()));
        }
        let old_parent = self.parents.get(id).cloned().ok_or_else(|| {
            LivecompError::validation(format!("cannot move root or detached node '{id}'"))
        })?;
        if let Some(rec) = self.nodes.get_mut(&old_parent) {
            rec.children.retain(|c| c != id);
        }
        let rec = self
            .nodes
            .get_mut(new_parent)
            .ok_or_else(|| LivecompError::ParentNotFound(new_parent.to_string()))?;
        let at = index.unwrap_or(rec.children.len()).min(rec.children.len());
        rec.children.insert(at, id.clone());
        self.parents.insert(id.clone(), new_parent.clone());
        Ok(())
    }

    /// Exchange two nodes' positions across their (possibly different)
    /// parents in one step, atomic with respect to this index only.
    pub(crate) fn swap(&mut self, a: &NodeId, b: &NodeId) -> LivecompResult<(NodeId, NodeId)> {
        let parent_a = self.parents.get(a).cloned().ok_or_else(|| {
            LivecompError::validation(format!("cannot swap root or detached node '{a}'"))
        })?;
        let parent_b = self.parents.get(b).cloned().ok_or_else(|| {
            LivecompError::validation(format!("cannot swap root or detached node '{b}'"))
        })?;
        let pos_a = self.position_of(&parent_a, a)?;
        let pos_b = self.position_of(&parent_b, b)?;
        if let Some(rec) = self.nodes.get_mut(&parent_a) {
            rec.children[pos_a] = b.clone();
        }
        if let Some(rec) = self.nodes.get_mut(&parent_b) {
            rec.children[pos_b] = a.clone();
        }
        self.parents.insert(a.clone(), parent_b.clone());
        self.parents.insert(b.clone(), parent_a.clone());
        Ok((parent_a, parent_b))
    }

    fn position_of(&self, parent: &NodeId, child: &NodeId) -> LivecompResult<usize> {
        self.nodes
            .get(parent)
            .and_then(|rec| rec.children.iter().position(|c| c == child))
            .ok_or_else(|| {
                LivecompError::validation(format!("node '{child}' not under parent '{parent}'"))
            })
    }

    /// Materialize a node with its subtree inlined. Tombstoned nodes are
    /// still reachable by id until reaped.
    pub(crate) fn get(&self, id: &NodeId) -> Option<SceneNode> {
        let rec = self.nodes.get(id)?;
        let children = rec
            .children
            .iter()
            .filter_map(|child| self.get(child))
            .collect();
        Some(SceneNode {
            id: id.clone(),
            props: rec.props.clone(),
            children,
            lifecycle: rec.lifecycle,
        })
    }

    pub(crate) fn props(&self, id: &NodeId) -> Option<NodeProps> {
        self.nodes.get(id).map(|rec| rec.props.clone())
    }

    pub(crate) fn data_node(&self, id: &NodeId) -> Option<DataNode> {
        self.nodes.get(id).map(|rec| DataNode {
            id: id.clone(),
            props: rec.props.clone(),
            child_ids: rec.children.clone(),
        })
    }

    pub(crate) fn parent_id(&self, id: &NodeId) -> Option<NodeId> {
        self.parents.get(id).cloned()
    }

    pub(crate) fn owner(&self, id: &NodeId) -> Option<ProjectId> {
        self.owners.get(id).cloned()
    }

    pub(crate) fn root_id(&self, project: &ProjectId) -> Option<NodeId> {
        self.roots.get(project).cloned()
    }

    pub(crate) fn node_ids_of(&self, project: &ProjectId) -> Vec<NodeId> {
        self.by_project
            .get(project)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop tombstoned nodes (and their detached subtrees) from the index.
    /// Returns the number of records removed.
    pub(crate) fn reap(&mut self, project: &ProjectId) -> usize {
        let Some(ids) = self.by_project.get(project) else {
            return 0;
        };
        let tombstoned: Vec<NodeId> = ids
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .is_some_and(|rec| !rec.lifecycle.is_active())
            })
            .cloned()
            .collect();
        let mut removed = 0;
        for id in tombstoned {
            removed += self.drop_subtree(project, &id);
        }
        removed
    }

    fn drop_subtree(&mut self, project: &ProjectId, id: &NodeId) -> usize {
        let Some(rec) = self.nodes.remove(id) else {
            return 0;
        };
        self.parents.remove(id);
        self.owners.remove(id);
        if let Some(set) = self.by_project.get_mut(project) {
            set.remove(id);
        }
        let mut removed = 1;
        for child in rec.children {
            removed += self.drop_subtree(project, &child);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectId {
        ProjectId::from("proj")
    }

    fn seed(index: &mut NodeIndex) -> NodeId {
        let root = NodeId::from("root");
        index
            .insert(&project(), root.clone(), NodeProps::default(), None, None)
            .unwrap();
        root
    }

    #[test]
    fn insert_missing_parent_fails() {
        let mut index = NodeIndex::new();
        seed(&mut index);
        let err = index
            .insert(
                &project(),
                NodeId::from("x"),
                NodeProps::default(),
                Some(&NodeId::from("nope")),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, LivecompError::ParentNotFound(_)));
    }

    #[test]
    fn insert_splices_at_index() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        for id in ["a", "b"] {
            index
                .insert(&project(), NodeId::from(id), NodeProps::default(), Some(&root), None)
                .unwrap();
        }
        index
            .insert(
                &project(),
                NodeId::from("mid"),
                NodeProps::default(),
                Some(&root),
                Some(1),
            )
            .unwrap();
        let children: Vec<String> = index
            .get(&root)
            .unwrap()
            .children
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(children, ["a", "mid", "b"]);
    }

    #[test]
    fn detach_tombstones_and_keeps_node_reachable() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        let child = NodeId::from("c");
        index
            .insert(&project(), child.clone(), NodeProps::default(), Some(&root), None)
            .unwrap();

        let old_parent = index.detach(&child).unwrap();
        assert_eq!(old_parent, Some(root.clone()));
        assert!(index.get(&root).unwrap().children.is_empty());
        assert!(index.get(&child).unwrap().is_tombstoned());
        assert!(index.parent_id(&child).is_none());
    }

    #[test]
    fn reorder_rejects_mismatched_set() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        for id in ["a", "b"] {
            index
                .insert(&project(), NodeId::from(id), NodeProps::default(), Some(&root), None)
                .unwrap();
        }
        let err = index
            .reorder(&root, &[NodeId::from("a"), NodeId::from("zzz")])
            .unwrap_err();
        assert!(matches!(err, LivecompError::Validation(_)));
        // untouched on failure
        let children: Vec<String> = index
            .get(&root)
            .unwrap()
            .children
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(children, ["a", "b"]);

        index
            .reorder(&root, &[NodeId::from("b"), NodeId::from("a")])
            .unwrap();
        let children: Vec<String> = index
            .get(&root)
            .unwrap()
            .children
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(children, ["b", "a"]);
    }

    #[test]
    fn swap_exchanges_across_parents() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        for id in ["left", "right"] {
            index
                .insert(&project(), NodeId::from(id), NodeProps::default(), Some(&root), None)
                .unwrap();
        }
        let (a, b) = (NodeId::from("a"), NodeId::from("b"));
        index
            .insert(&project(), a.clone(), NodeProps::default(), Some(&NodeId::from("left")), None)
            .unwrap();
        index
            .insert(&project(), b.clone(), NodeProps::default(), Some(&NodeId::from("right")), None)
            .unwrap();

        index.swap(&a, &b).unwrap();
        assert_eq!(index.parent_id(&a), Some(NodeId::from("right")));
        assert_eq!(index.parent_id(&b), Some(NodeId::from("left")));
        assert_eq!(
            index.get(&NodeId::from("left")).unwrap().children[0].id,
            b
        );
    }

    #[test]
    fn every_active_node_has_one_parent_slot() {
        // Tree-consistency check after a mixed op sequence.
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        for id in ["a", "b", "c"] {
            index
                .insert(&project(), NodeId::from(id), NodeProps::default(), Some(&root), None)
                .unwrap();
        }
        index
            .move_node(&NodeId::from("c"), &NodeId::from("a"), None)
            .unwrap();
        index.swap(&NodeId::from("a"), &NodeId::from("b")).unwrap();
        index.detach(&NodeId::from("c")).unwrap();

        let tree = index.get(&root).unwrap();
        let mut seen = std::collections::BTreeMap::new();
        fn walk(node: &SceneNode, seen: &mut std::collections::BTreeMap<String, usize>) {
            for child in &node.children {
                *seen.entry(child.id.to_string()).or_default() += 1;
                walk(child, seen);
            }
        }
        walk(&tree, &mut seen);
        for (id, count) in seen {
            assert_eq!(count, 1, "node {id} appears {count} times");
        }
    }

    #[test]
    fn root_replacement_tombstones_the_old_root() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        index
            .insert(&project(), NodeId::from("kid"), NodeProps::default(), Some(&root), None)
            .unwrap();

        let new_root = NodeId::from("root2");
        index
            .insert(&project(), new_root.clone(), NodeProps::default(), None, None)
            .unwrap();
        assert_eq!(index.root_id(&project()), Some(new_root.clone()));
        assert!(index.get(&root).unwrap().is_tombstoned());

        // the replaced subtree is reapable, the new root untouched
        assert_eq!(index.reap(&project()), 2);
        assert!(index.get(&root).is_none());
        assert!(index.get(&NodeId::from("kid")).is_none());
        assert!(index.get(&new_root).is_some());
    }

    #[test]
    fn reap_drops_tombstones_and_subtrees() {
        let mut index = NodeIndex::new();
        let root = seed(&mut index);
        index
            .insert(&project(), NodeId::from("a"), NodeProps::default(), Some(&root), None)
            .unwrap();
        index
            .insert(
                &project(),
                NodeId::from("a1"),
                NodeProps::default(),
                Some(&NodeId::from("a")),
                None,
            )
            .unwrap();
        index.detach(&NodeId::from("a")).unwrap();

        assert_eq!(index.reap(&project()), 2);
        assert!(index.get(&NodeId::from("a")).is_none());
        assert!(index.get(&NodeId::from("a1")).is_none());
        assert!(index.get(&root).is_some());
    }
}
