//! Component system: named behaviors attached to node types.
//!
//! A component declares commands, queries, child validation, and a render
//! expansion that turns a node's abstract state into structural children
//! (e.g. a background + content + foreground layering). Dispatch is by the
//! node's declared type through the registry; a node whose type has no
//! registered component still exists in the tree, but its command/query
//! surface is inert.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::engine::CompositorEngine;
use crate::events::{Event, EventKind, Subscription};
use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::{self, NodeId, ProjectId};
use crate::scene::node::{NodePatch, NodeProps, SceneNode};
use crate::sources::Source;

/// A named, versioned behavior attached to nodes of one declared type.
///
/// Every method takes `&self`; component implementations are shared,
/// read-only declarations. Per-node state lives in the node's
/// `component_props`, reached through the [`NodeContext`].
pub trait Component {
    /// Registry name (the node `type` this behavior attaches to).
    fn name(&self) -> &str;

    /// Declaration version, for migrations.
    fn version(&self) -> u32 {
        1
    }

    /// Source types this component consumes. `create_component` seeds an
    /// empty declaration list for each.
    fn sources(&self) -> Vec<String> {
        Vec::new()
    }

    /// Child-list validation: may `child` be inserted under a node of this
    /// type? Checked by the tree mutation operations.
    fn accepts_child(&self, child: &NodeProps) -> bool {
        let _ = child;
        true
    }

    /// Command names, registered globally as `"{name}.{command}"`.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Query names.
    fn queries(&self) -> Vec<String> {
        Vec::new()
    }

    /// Normalize caller props into this component's `component_props`.
    fn create(&self, props: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        props
    }

    /// Migrate `component_props` written by an older declaration version.
    fn migrate(&self, from_version: u32, props: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let _ = from_version;
        props
    }

    /// Run a command. Each invocation receives a context that observes
    /// current node state, never a stale snapshot.
    fn execute(&self, ctx: &NodeContext, command: &str, args: Value) -> LivecompResult<Value> {
        let _ = (ctx, command, args);
        Ok(Value::Null)
    }

    /// Run a query.
    fn query(&self, ctx: &NodeContext, query: &str, args: Value) -> LivecompResult<Value> {
        let _ = (ctx, query, args);
        Ok(Value::Null)
    }

    /// Expand the node into a concrete subtree for the rendering backend.
    ///
    /// Must be idempotent: rendering twice with the same context and
    /// helpers yields structurally identical output (same ids, same
    /// props). Use [`RenderHelpers::id`] for synthetic children. The
    /// default expansion is the node itself, unchanged.
    fn render(&self, ctx: &NodeContext, helpers: &RenderHelpers) -> LivecompResult<SceneNode> {
        let _ = helpers;
        ctx.node()
    }
}

/// Registry of component declarations plus the global command index.
#[derive(Default)]
pub(crate) struct ComponentRegistry {
    components: HashMap<String, Rc<dyn Component>>,
    // "Component.command" -> (component, command)
    commands: HashMap<String, (String, String)>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ComponentRegistry {
    pub(crate) fn register(&mut self, component: Rc<dyn Component>) -> LivecompResult<()> {
        let name = component.name().to_owned();
        if name.is_empty() {
            return Err(LivecompError::registration(
                "component must declare a name",
            ));
        }
        if self.components.contains_key(&name) {
            return Err(LivecompError::registration(format!(
                "component '{name}' is already registered"
            )));
        }
        for command in component.commands() {
            self.commands
                .insert(format!("{name}.{command}"), (name.clone(), command));
        }
        tracing::debug!(component = %name, "component registered");
        self.components.insert(name, component);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Rc<dyn Component>> {
        self.components.get(name).cloned()
    }

    pub(crate) fn command(&self, key: &str) -> Option<(String, String)> {
        self.commands.get(key).cloned()
    }
}

/// Live, per-node execution context handed to component code.
///
/// Holds only ids plus the engine handle, so every read goes to current
/// index state.
#[derive(Clone, Debug)]
pub struct NodeContext {
    engine: CompositorEngine,
    project_id: ProjectId,
    node_id: NodeId,
}

impl NodeContext {
    pub(crate) fn new(engine: CompositorEngine, project_id: ProjectId, node_id: NodeId) -> Self {
        Self {
            engine,
            project_id,
            node_id,
        }
    }

    /// The node this context is bound to.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The owning project.
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// The engine handle, for registry/source access.
    pub fn engine(&self) -> &CompositorEngine {
        &self.engine
    }

    /// Current snapshot of the node with its subtree.
    pub fn node(&self) -> LivecompResult<SceneNode> {
        self.engine
            .inner
            .index
            .borrow()
            .get(&self.node_id)
            .ok_or_else(|| {
                LivecompError::validation(format!("node '{}' is not indexed", self.node_id))
            })
    }

    /// Current props of the node.
    pub fn props(&self) -> LivecompResult<NodeProps> {
        self.engine
            .inner
            .index
            .borrow()
            .props(&self.node_id)
            .ok_or_else(|| {
                LivecompError::validation(format!("node '{}' is not indexed", self.node_id))
            })
    }

    /// Merge partial state into the node's `component_props` and run it
    /// through the standard update pipeline (persist + `NodeChanged`).
    pub fn update(&self, partial: BTreeMap<String, Value>) -> LivecompResult<()> {
        let mut component_props = self.props()?.component_props;
        for (k, v) in partial {
            component_props.insert(k, v);
        }
        crate::project::apply_update(
            &self.engine,
            &self.project_id,
            &self.node_id,
            NodePatch::component_props(component_props),
        )
    }

    /// Subscribe to `NodeChanged` filtered to this node. Cancel the
    /// returned handle to unsubscribe.
    pub fn on_change(&self, handler: impl FnMut(&Event) + 'static) -> Subscription {
        self.engine
            .on(EventKind::NodeChanged, handler, Some(self.node_id.clone()))
    }

    /// Current sources of a type, for render expansion.
    pub fn sources(&self, source_type: &str) -> Vec<Source> {
        self.engine.get_sources(source_type)
    }
}

/// Deterministic id helpers for render expansion.
///
/// Ids derive from the expanded node's id and a label, so re-rendering the
/// same node yields the same synthetic child ids.
#[derive(Clone, Debug)]
pub struct RenderHelpers {
    namespace: NodeId,
}

impl RenderHelpers {
    /// Helpers namespaced to one node.
    pub fn for_node(node_id: &NodeId) -> Self {
        Self {
            namespace: node_id.clone(),
        }
    }

    /// A stable synthetic id for `label` within this namespace.
    pub fn id(&self, label: &str) -> NodeId {
        ids::scoped_id(&self.namespace, label)
    }

    /// A synthetic leaf node named by `label`.
    pub fn node(&self, label: &str, props: NodeProps) -> SceneNode {
        SceneNode::new(self.id(label), props)
    }

    /// Helpers namespaced one level deeper.
    pub fn scoped(&self, label: &str) -> Self {
        Self {
            namespace: self.id(label),
        }
    }
}

/// Per-node component dispatch surface.
///
/// When the node's declared type has no registered component this is a
/// degenerate context: commands and queries are no-ops returning `null`,
/// not errors.
pub struct NodeComponent {
    component: Option<Rc<dyn Component>>,
    ctx: NodeContext,
}

impl NodeComponent {
    /// False when the node's type is unregistered (inert surface).
    pub fn is_registered(&self) -> bool {
        self.component.is_some()
    }

    /// The live context bound to this node.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Run a command against this node.
    pub fn execute(&self, command: &str, args: Value) -> LivecompResult<Value> {
        match &self.component {
            Some(component) => component.execute(&self.ctx, command, args),
            None => {
                tracing::debug!(node = %self.ctx.node_id(), command, "command on unregistered type ignored");
                Ok(Value::Null)
            }
        }
    }

    /// The source currently bound to this node's render element, if the
    /// element exists and is bound.
    pub fn source(&self) -> Option<Source> {
        self.ctx
            .engine()
            .inner
            .elements
            .borrow()
            .get(self.ctx.node_id())
            .and_then(|element| element.source())
    }

    /// Run a query against this node.
    pub fn query(&self, query: &str, args: Value) -> LivecompResult<Value> {
        match &self.component {
            Some(component) => component.query(&self.ctx, query, args),
            None => Ok(Value::Null),
        }
    }

    /// Expand this node; identity when the type is unregistered.
    pub fn render(&self) -> LivecompResult<SceneNode> {
        match &self.component {
            Some(component) => {
                component.render(&self.ctx, &RenderHelpers::for_node(self.ctx.node_id()))
            }
            None => self.ctx.node(),
        }
    }
}

impl CompositorEngine {
    /// Seed props for a node of a registered component type.
    ///
    /// Fails `ComponentNotFound` for unregistered types. Caller props are
    /// normalized through the component's `create`; an empty source list is
    /// seeded for each source type the component declares, overridden by
    /// `sources` where provided.
    pub fn create_component(
        &self,
        component_type: &str,
        props: BTreeMap<String, Value>,
        sources: Option<BTreeMap<String, Vec<Value>>>,
    ) -> LivecompResult<NodeProps> {
        let component = self
            .inner
            .components
            .borrow()
            .get(component_type)
            .ok_or_else(|| LivecompError::ComponentNotFound(component_type.to_owned()))?;
        let mut source_lists: BTreeMap<String, Vec<Value>> = component
            .sources()
            .into_iter()
            .map(|t| (t, Vec::new()))
            .collect();
        if let Some(overrides) = sources {
            for (k, v) in overrides {
                source_lists.insert(k, v);
            }
        }
        Ok(NodeProps {
            component: Some(component_type.to_owned()),
            component_props: component.create(props),
            sources: source_lists,
            ..NodeProps::default()
        })
    }

    /// Build the per-node dispatch surface for `node_id`.
    ///
    /// Fails only when the node itself is unknown; an unregistered
    /// component type yields a degenerate (inert) surface instead.
    pub fn node_component(&self, node_id: &NodeId) -> LivecompResult<NodeComponent> {
        let (props, project_id) = {
            let index = self.inner.index.borrow();
            let props = index.props(node_id).ok_or_else(|| {
                LivecompError::validation(format!("node '{node_id}' is not indexed"))
            })?;
            let project_id = index.owner(node_id).ok_or_else(|| {
                LivecompError::validation(format!("node '{node_id}' has no owning project"))
            })?;
            (props, project_id)
        };
        let component = props
            .component
            .as_deref()
            .and_then(|t| self.inner.components.borrow().get(t));
        Ok(NodeComponent {
            component,
            ctx: NodeContext::new(self.clone(), project_id, node_id.clone()),
        })
    }

    /// Dispatch a globally addressed command (`"Component.command"`).
    pub fn execute_command(
        &self,
        key: &str,
        node_id: &NodeId,
        args: Value,
    ) -> LivecompResult<Value> {
        let (component_name, command) = self
            .inner
            .components
            .borrow()
            .command(key)
            .ok_or_else(|| LivecompError::validation(format!("unknown command key '{key}'")))?;
        let component = self
            .inner
            .components
            .borrow()
            .get(&component_name)
            .ok_or_else(|| LivecompError::ComponentNotFound(component_name.clone()))?;
        let surface = self.node_component(node_id)?;
        component.execute(surface.context(), &command, args)
    }

    /// Expand a project's tree into the concrete form the rendering
    /// backend consumes, by walking the tree and invoking each node's
    /// component render.
    pub fn render_tree(&self, project_id: &ProjectId) -> LivecompResult<SceneNode> {
        let root = {
            let index = self.inner.index.borrow();
            let root_id = index.root_id(project_id).ok_or_else(|| {
                LivecompError::validation(format!("project '{project_id}' has no root"))
            })?;
            index.get(&root_id).ok_or_else(|| {
                LivecompError::validation(format!("root of '{project_id}' is not indexed"))
            })?
        };
        self.expand_node(project_id, root)
    }

    /// Expand one node (and, recursively, the children of its expansion).
    ///
    /// Synthetic nodes produced by a render (not present in the index)
    /// pass through unchanged apart from child recursion.
    pub fn expand_node(&self, project_id: &ProjectId, node: SceneNode) -> LivecompResult<SceneNode> {
        let indexed = self.inner.index.borrow().props(&node.id).is_some();
        let component = if indexed {
            node.props
                .component
                .as_deref()
                .and_then(|t| self.inner.components.borrow().get(t))
        } else {
            None
        };
        let mut expanded = match component {
            Some(component) => {
                let ctx = NodeContext::new(self.clone(), project_id.clone(), node.id.clone());
                let helpers = RenderHelpers::for_node(&node.id);
                component.render(&ctx, &helpers)?
            }
            None => node,
        };
        expanded.children = expanded
            .children
            .into_iter()
            .map(|child| self.expand_node(project_id, child))
            .collect::<LivecompResult<_>>()?;
        Ok(expanded)
    }
}
