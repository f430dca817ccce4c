//! Project handle and the persistence adapter boundary.
//!
//! A [`Project`] is a thin handle over one scene tree held by the engine.
//! Every mutation follows the same contract: the in-memory index mutates
//! first, matching events fire synchronously, and only then is the
//! project's [`ProjectStore`] called. Persistence failures propagate to the
//! caller but never roll the in-memory state back; the index is the source
//! of truth for the running session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::engine::CompositorEngine;
use crate::events::Event;
use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::{NodeId, ProjectId};
use crate::scene::node::{DataNode, NodePatch, NodeProps, SceneNode};

// ----------------------------------------------------------------------
// Adapter boundary
// ----------------------------------------------------------------------

/// Persisted state of one project: the root id plus the flat node records.
///
/// Records unreachable from the root (detached subtrees whose removal was
/// persisted) are ignored on load.
#[derive(Debug, Clone)]
pub struct PersistedProject {
    /// Root node id.
    pub root: NodeId,
    /// Flat node records, any order.
    pub nodes: Vec<DataNode>,
}

/// Per-project persistence surface, called synchronously after each
/// successful in-memory mutation.
///
/// `update` receives the full flattened record (props *and* child order),
/// so structural operations that only re-sequence children (reorder, move,
/// swap) persist as parent updates.
pub trait ProjectStore {
    /// Read back the persisted state, if the project has any.
    fn load(&self) -> anyhow::Result<Option<PersistedProject>>;

    /// Persist a newly inserted node, spliced under `parent` at `index`
    /// (end when absent). No parent means the node is the project root.
    fn insert(
        &mut self,
        node: &DataNode,
        parent: Option<&NodeId>,
        index: Option<usize>,
    ) -> anyhow::Result<()>;

    /// Persist a node's current record wholesale.
    fn update(&mut self, node: &DataNode) -> anyhow::Result<()>;

    /// Persist a node's removal. The engine follows up with an `update` of
    /// the old parent carrying the shortened child list.
    fn remove(&mut self, id: &NodeId) -> anyhow::Result<()>;
}

/// Factory for per-project stores. Implemented by the host; the engine
/// ships [`MemoryAdapter`] for tests and hosts without durability needs.
pub trait Adapter {
    /// Open (or create) the store backing one project. The reader gives
    /// the store read access to the live index, e.g. for compound writes.
    fn project(
        &self,
        project_id: &ProjectId,
        reader: IndexReader,
    ) -> anyhow::Result<Box<dyn ProjectStore>>;
}

/// Read-only view of one project's live index, handed to adapters.
#[derive(Clone)]
pub struct IndexReader {
    engine: CompositorEngine,
    project_id: ProjectId,
}

impl fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexReader")
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl IndexReader {
    /// The project this reader is scoped to.
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Materialize a node with its subtree.
    pub fn node(&self, id: &NodeId) -> Option<SceneNode> {
        self.engine.inner.index.borrow().get(id)
    }

    /// A node's flattened record.
    pub fn data_node(&self, id: &NodeId) -> Option<DataNode> {
        self.engine.inner.index.borrow().data_node(id)
    }

    /// A node's parent id.
    pub fn parent(&self, id: &NodeId) -> Option<NodeId> {
        self.engine.inner.index.borrow().parent_id(id)
    }

    /// The project's root id.
    pub fn root_id(&self) -> Option<NodeId> {
        self.engine.inner.index.borrow().root_id(&self.project_id)
    }

    /// Every indexed node id of the project, tombstoned included.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.engine.inner.index.borrow().node_ids_of(&self.project_id)
    }
}

// ----------------------------------------------------------------------
// In-memory adapter
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryProject {
    root: Option<NodeId>,
    nodes: HashMap<NodeId, DataNode>,
}

/// In-process adapter: node records in a shared map, no durability.
///
/// Clones share state, so one `MemoryAdapter` handed to two engines acts
/// as a common backing store (the load path in tests relies on this).
#[derive(Debug, Default, Clone)]
pub struct MemoryAdapter {
    projects: Rc<RefCell<HashMap<ProjectId, MemoryProject>>>,
}

impl MemoryAdapter {
    /// An empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Adapter for MemoryAdapter {
    fn project(
        &self,
        project_id: &ProjectId,
        _reader: IndexReader,
    ) -> anyhow::Result<Box<dyn ProjectStore>> {
        self.projects
            .borrow_mut()
            .entry(project_id.clone())
            .or_default();
        Ok(Box::new(MemoryStore {
            projects: Rc::clone(&self.projects),
            project_id: project_id.clone(),
        }))
    }
}

struct MemoryStore {
    projects: Rc<RefCell<HashMap<ProjectId, MemoryProject>>>,
    project_id: ProjectId,
}

impl MemoryStore {
    fn with_project<T>(
        &self,
        f: impl FnOnce(&mut MemoryProject) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut projects = self.projects.borrow_mut();
        let project = projects
            .get_mut(&self.project_id)
            .ok_or_else(|| anyhow::anyhow!("project '{}' is not backed", self.project_id))?;
        f(project)
    }
}

impl ProjectStore for MemoryStore {
    fn load(&self) -> anyhow::Result<Option<PersistedProject>> {
        let projects = self.projects.borrow();
        let Some(project) = projects.get(&self.project_id) else {
            return Ok(None);
        };
        Ok(project.root.clone().map(|root| PersistedProject {
            root,
            nodes: project.nodes.values().cloned().collect(),
        }))
    }

    fn insert(
        &mut self,
        node: &DataNode,
        parent: Option<&NodeId>,
        index: Option<usize>,
    ) -> anyhow::Result<()> {
        self.with_project(|project| {
            match parent {
                Some(parent_id) => {
                    let parent_rec = project.nodes.get_mut(parent_id).ok_or_else(|| {
                        anyhow::anyhow!("parent '{parent_id}' is not persisted")
                    })?;
                    let at = index
                        .unwrap_or(parent_rec.child_ids.len())
                        .min(parent_rec.child_ids.len());
                    parent_rec.child_ids.insert(at, node.id.clone());
                }
                None => project.root = Some(node.id.clone()),
            }
            project.nodes.insert(node.id.clone(), node.clone());
            Ok(())
        })
    }

    fn update(&mut self, node: &DataNode) -> anyhow::Result<()> {
        self.with_project(|project| {
            project.nodes.insert(node.id.clone(), node.clone());
            Ok(())
        })
    }

    fn remove(&mut self, id: &NodeId) -> anyhow::Result<()> {
        self.with_project(|project| {
            project.nodes.remove(id);
            if project.root.as_ref() == Some(id) {
                project.root = None;
            }
            Ok(())
        })
    }
}

// ----------------------------------------------------------------------
// Engine: project lifecycle
// ----------------------------------------------------------------------

pub(crate) type SharedStore = Rc<RefCell<Box<dyn ProjectStore>>>;

impl CompositorEngine {
    /// The (lazily opened) store backing one project.
    pub(crate) fn store_for(&self, project_id: &ProjectId) -> LivecompResult<SharedStore> {
        if let Some(store) = self.inner.stores.borrow().get(project_id) {
            return Ok(Rc::clone(store));
        }
        let reader = IndexReader {
            engine: self.clone(),
            project_id: project_id.clone(),
        };
        let store = self
            .inner
            .adapter
            .project(project_id, reader)
            .map_err(LivecompError::Persistence)?;
        let store = Rc::new(RefCell::new(store));
        self.inner
            .stores
            .borrow_mut()
            .insert(project_id.clone(), Rc::clone(&store));
        Ok(store)
    }

    /// Create an empty project with a fresh id.
    pub fn create_project(&self) -> LivecompResult<Project> {
        let project_id = self.inner.ids.project_id();
        self.store_for(&project_id)?;
        tracing::info!(project = %project_id, "project created");
        Ok(Project {
            engine: self.clone(),
            id: project_id,
        })
    }

    /// Load a project's persisted tree into the index and return its
    /// handle. Already-loaded projects return their handle unchanged.
    ///
    /// Nodes whose declared component carries a higher `version` than the
    /// persisted `componentVersion` are run through the component's
    /// `migrate` hook and written back.
    pub fn load_project(&self, project_id: &ProjectId) -> LivecompResult<Project> {
        let handle = Project {
            engine: self.clone(),
            id: project_id.clone(),
        };
        if self.inner.index.borrow().root_id(project_id).is_some() {
            return Ok(handle);
        }
        let store = self.store_for(project_id)?;
        let persisted = store
            .borrow()
            .load()
            .map_err(LivecompError::Persistence)?;
        let Some(persisted) = persisted else {
            return Ok(handle);
        };

        let records: HashMap<NodeId, DataNode> = persisted
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let mut tree = build_tree(&records, &persisted.root).ok_or_else(|| {
            LivecompError::validation(format!(
                "persisted root '{}' of '{project_id}' is missing",
                persisted.root
            ))
        })?;

        let mut migrated = Vec::new();
        self.migrate_tree(&mut tree, &mut migrated);
        self.inner
            .index
            .borrow_mut()
            .adopt_tree(project_id, &tree, None)?;
        for id in migrated {
            let Some(data) = self.inner.index.borrow().data_node(&id) else {
                continue;
            };
            store
                .borrow_mut()
                .update(&data)
                .map_err(LivecompError::Persistence)?;
        }
        tracing::info!(project = %project_id, "project loaded");
        Ok(handle)
    }

    fn migrate_tree(&self, node: &mut SceneNode, migrated: &mut Vec<NodeId>) {
        if let Some(component) = node
            .props
            .component
            .as_deref()
            .and_then(|t| self.inner.components.borrow().get(t))
        {
            let from = node
                .props
                .extra
                .get("componentVersion")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(1);
            let to = component.version();
            if from < to {
                let props = std::mem::take(&mut node.props.component_props);
                node.props.component_props = component.migrate(from, props);
                node.props
                    .extra
                    .insert("componentVersion".to_owned(), Value::from(to));
                tracing::info!(node = %node.id, from, to, "component props migrated");
                migrated.push(node.id.clone());
            }
        }
        for child in &mut node.children {
            self.migrate_tree(child, migrated);
        }
    }
}

fn build_tree(records: &HashMap<NodeId, DataNode>, id: &NodeId) -> Option<SceneNode> {
    let record = records.get(id)?;
    let children = record
        .child_ids
        .iter()
        .filter_map(|child| {
            let node = build_tree(records, child);
            if node.is_none() {
                tracing::warn!(node = %id, child = %child, "persisted child record missing");
            }
            node
        })
        .collect();
    Some(SceneNode::new(record.id.clone(), record.props.clone()).with_children(children))
}

// ----------------------------------------------------------------------
// Project handle
// ----------------------------------------------------------------------

/// Handle over one scene tree. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Project {
    engine: CompositorEngine,
    id: ProjectId,
}

impl Project {
    /// The project id.
    pub fn id(&self) -> &ProjectId {
        &self.id
    }

    /// Insert a node and return its allocated id.
    ///
    /// No parent establishes (or replaces) the project root; otherwise the
    /// node is spliced into the parent's children at `index` (end when
    /// absent). If the parent's declared component rejects the child via
    /// `accepts_child` the insert fails validation. Emits `NodeInserted`,
    /// then persists.
    pub fn insert(
        &self,
        props: NodeProps,
        parent: Option<&NodeId>,
        index: Option<usize>,
    ) -> LivecompResult<NodeId> {
        if let Some(parent_id) = parent {
            self.check_accepts(parent_id, &props)?;
        }
        let id = self.engine.inner.ids.node_id();
        self.engine
            .inner
            .index
            .borrow_mut()
            .insert(&self.id, id.clone(), props, parent, index)?;
        tracing::debug!(project = %self.id, node = %id, "node inserted");
        self.engine.emit(&Event::NodeInserted {
            project_id: self.id.clone(),
            node_id: id.clone(),
            parent_id: parent.cloned(),
        });
        let data = self.data_node_or_fail(&id)?;
        self.store()?
            .borrow_mut()
            .insert(&data, parent, index)
            .map_err(LivecompError::Persistence)?;
        Ok(id)
    }

    /// Shallow-merge a patch into a node's props. Children untouched.
    /// Emits `NodeChanged`, then persists.
    pub fn update(&self, id: &NodeId, patch: NodePatch) -> LivecompResult<()> {
        apply_update(&self.engine, &self.id, id, patch)
    }

    /// Detach a node from its parent and tombstone it; the node stays
    /// reachable by id until [`Project::reap`]. Emits `NodeRemoved`, then
    /// persists the removal plus the parent's shortened child list.
    pub fn remove(&self, id: &NodeId) -> LivecompResult<()> {
        self.check_owned(id)?;
        let old_parent = self.engine.inner.index.borrow_mut().detach(id)?;
        tracing::debug!(project = %self.id, node = %id, "node removed");
        self.engine.emit(&Event::NodeRemoved {
            project_id: self.id.clone(),
            node_id: id.clone(),
        });
        let store = self.store()?;
        store
            .borrow_mut()
            .remove(id)
            .map_err(LivecompError::Persistence)?;
        if let Some(parent_id) = old_parent {
            let data = self.data_node_or_fail(&parent_id)?;
            store
                .borrow_mut()
                .update(&data)
                .map_err(LivecompError::Persistence)?;
        }
        Ok(())
    }

    /// Re-sequence a parent's children to match `order` exactly.
    ///
    /// Fail-fast: an order that is not a permutation of the existing
    /// children is rejected and nothing changes. Emits `NodeChanged` for
    /// the parent, then persists.
    pub fn reorder(&self, parent: &NodeId, order: &[NodeId]) -> LivecompResult<()> {
        self.check_owned(parent)?;
        self.engine.inner.index.borrow_mut().reorder(parent, order)?;
        self.emit_changed(parent);
        self.persist_record(parent)
    }

    /// Move a node under a new parent at `index` (end when absent).
    ///
    /// Permissive: moving a node into its own subtree is not checked.
    /// Emits `NodeChanged` for the moved node, then persists both parents.
    pub fn move_node(
        &self,
        id: &NodeId,
        new_parent: &NodeId,
        index: Option<usize>,
    ) -> LivecompResult<()> {
        self.check_owned(id)?;
        if let Some(props) = self.engine.inner.index.borrow().props(id) {
            self.check_accepts(new_parent, &props)?;
        }
        let old_parent = self.engine.inner.index.borrow().parent_id(id);
        self.engine
            .inner
            .index
            .borrow_mut()
            .move_node(id, new_parent, index)?;
        self.emit_changed(id);
        if let Some(old_parent) = old_parent.filter(|p| p != new_parent) {
            self.persist_record(&old_parent)?;
        }
        self.persist_record(new_parent)
    }

    /// Exchange two nodes' positions across their (possibly different)
    /// parents. Emits `NodeChanged` for both nodes, then persists the
    /// affected parents.
    pub fn swap(&self, a: &NodeId, b: &NodeId) -> LivecompResult<()> {
        self.check_owned(a)?;
        self.check_owned(b)?;
        let (parent_a, parent_b) = self.engine.inner.index.borrow_mut().swap(a, b)?;
        self.emit_changed(a);
        self.emit_changed(b);
        self.persist_record(&parent_a)?;
        if parent_b != parent_a {
            self.persist_record(&parent_b)?;
        }
        Ok(())
    }

    /// Materialize a node with its subtree. Tombstoned nodes stay
    /// reachable until reaped.
    pub fn get(&self, id: &NodeId) -> Option<SceneNode> {
        self.engine.inner.index.borrow().get(id)
    }

    /// A node's parent id, absent for roots and detached nodes.
    pub fn get_parent(&self, id: &NodeId) -> Option<NodeId> {
        self.engine.inner.index.borrow().parent_id(id)
    }

    /// The materialized root, when one has been established.
    pub fn get_root(&self) -> Option<SceneNode> {
        let index = self.engine.inner.index.borrow();
        index.root_id(&self.id).and_then(|root| index.get(&root))
    }

    /// Every indexed node id of the project, tombstoned included.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.engine.inner.index.borrow().node_ids_of(&self.id)
    }

    /// Snapshot of the tree for a render pass: the root with tombstoned
    /// descendants filtered out. Fails when no root exists.
    pub fn tree(&self) -> LivecompResult<SceneNode> {
        let mut root = self.get_root().ok_or_else(|| {
            LivecompError::validation(format!("project '{}' has no root", self.id))
        })?;
        fn prune(node: &mut SceneNode) {
            node.children.retain(|c| !c.is_tombstoned());
            for child in &mut node.children {
                prune(child);
            }
        }
        prune(&mut root);
        Ok(root)
    }

    /// Drop tombstoned nodes (and their detached subtrees) from the index
    /// and the store. Returns the number of records reaped.
    pub fn reap(&self) -> LivecompResult<usize> {
        let doomed: Vec<NodeId> = {
            let index = self.engine.inner.index.borrow();
            index
                .node_ids_of(&self.id)
                .into_iter()
                .filter(|id| index.get(id).is_some_and(|n| n.is_tombstoned()))
                .flat_map(|id| {
                    let mut ids = Vec::new();
                    if let Some(tree) = index.get(&id) {
                        collect_ids(&tree, &mut ids);
                    }
                    ids
                })
                .collect()
        };
        let removed = self.engine.inner.index.borrow_mut().reap(&self.id);
        let store = self.store()?;
        for id in &doomed {
            store
                .borrow_mut()
                .remove(id)
                .map_err(LivecompError::Persistence)?;
        }
        if removed > 0 {
            tracing::debug!(project = %self.id, removed, "tombstones reaped");
        }
        Ok(removed)
    }

    fn store(&self) -> LivecompResult<SharedStore> {
        self.engine.store_for(&self.id)
    }

    fn emit_changed(&self, id: &NodeId) {
        self.engine.emit(&Event::NodeChanged {
            project_id: self.id.clone(),
            node_id: id.clone(),
        });
    }

    fn persist_record(&self, id: &NodeId) -> LivecompResult<()> {
        let data = self.data_node_or_fail(id)?;
        self.store()?
            .borrow_mut()
            .update(&data)
            .map_err(LivecompError::Persistence)
    }

    fn data_node_or_fail(&self, id: &NodeId) -> LivecompResult<DataNode> {
        self.engine
            .inner
            .index
            .borrow()
            .data_node(id)
            .ok_or_else(|| LivecompError::validation(format!("node '{id}' is not indexed")))
    }

    fn check_owned(&self, id: &NodeId) -> LivecompResult<()> {
        match self.engine.inner.index.borrow().owner(id) {
            Some(owner) if owner == self.id => Ok(()),
            Some(owner) => Err(LivecompError::validation(format!(
                "node '{id}' belongs to project '{owner}'"
            ))),
            None => Err(LivecompError::validation(format!("unknown node '{id}'"))),
        }
    }

    // Child-list validation against the parent's declared component.
    fn check_accepts(&self, parent_id: &NodeId, child: &NodeProps) -> LivecompResult<()> {
        let Some(parent_props) = self.engine.inner.index.borrow().props(parent_id) else {
            return Err(LivecompError::ParentNotFound(parent_id.to_string()));
        };
        let component = parent_props
            .component
            .as_deref()
            .and_then(|t| self.engine.inner.components.borrow().get(t));
        if let Some(component) = component {
            if !component.accepts_child(child) {
                return Err(LivecompError::validation(format!(
                    "component '{}' rejects the child",
                    component.name()
                )));
            }
        }
        Ok(())
    }
}

fn collect_ids(node: &SceneNode, out: &mut Vec<NodeId>) {
    out.push(node.id.clone());
    for child in &node.children {
        collect_ids(child, out);
    }
}

/// Shared update pipeline: index merge, `NodeChanged`, persist. Used by
/// [`Project::update`] and [`crate::components::NodeContext::update`].
pub(crate) fn apply_update(
    engine: &CompositorEngine,
    project_id: &ProjectId,
    node_id: &NodeId,
    patch: NodePatch,
) -> LivecompResult<()> {
    match engine.inner.index.borrow().owner(node_id) {
        Some(owner) if &owner == project_id => {}
        Some(owner) => {
            return Err(LivecompError::validation(format!(
                "node '{node_id}' belongs to project '{owner}'"
            )));
        }
        None => {
            return Err(LivecompError::validation(format!(
                "unknown node '{node_id}'"
            )));
        }
    }
    engine.inner.index.borrow_mut().update(node_id, patch)?;
    tracing::debug!(project = %project_id, node = %node_id, "node updated");
    engine.emit(&Event::NodeChanged {
        project_id: project_id.clone(),
        node_id: node_id.clone(),
    });
    let data = engine
        .inner
        .index
        .borrow()
        .data_node(node_id)
        .ok_or_else(|| LivecompError::validation(format!("node '{node_id}' is not indexed")))?;
    engine
        .store_for(project_id)?
        .borrow_mut()
        .update(&data)
        .map_err(LivecompError::Persistence)
}
