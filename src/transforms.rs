//! Transform resolution: binding scene nodes to concrete render elements.
//!
//! A transform adapts one kind of node (by explicit name or by source type)
//! into a backend-consumable element and keeps it synchronized with its
//! bound [`Source`]. Per node the element moves through
//! `Unbound -> Bound -> Rebound.. -> Removed`; rebinding is driven entirely
//! by source events, never by re-creating the element.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::engine::CompositorEngine;
use crate::events::{Event, EventKind, Subscription};
use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::NodeId;
use crate::scene::node::{NodeProps, SceneNode};
use crate::sources::{Source, match_source};

/// Outcome of a transform's custom source selection.
pub enum SourceSelection {
    /// Use the registry's default matching rule.
    Auto,
    /// Bind this source.
    Bind(Source),
    /// Bind nothing.
    None,
}

/// A registered element factory for one kind of node.
pub trait Transform {
    /// Registry name (matched against a node's explicit `element` prop).
    fn name(&self) -> &str;

    /// Source type this transform serves; makes it the default transform
    /// for nodes declaring that `source_type` (first registration wins).
    fn source_type(&self) -> Option<&str> {
        None
    }

    /// Custom binding rule; authoritative when it returns anything but
    /// [`SourceSelection::Auto`].
    fn select_source(&self, candidates: &[Source], props: &NodeProps) -> SourceSelection {
        let _ = (candidates, props);
        SourceSelection::Auto
    }

    /// Instantiate the element for a node: register lifecycle callbacks on
    /// `hooks` and return the backend-opaque root handle.
    fn create(&self, hooks: &mut ElementHooks, props: &NodeProps) -> Rc<dyn Any>;
}

impl fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name())
            .finish()
    }
}

type NewSourceFn = Box<dyn FnMut(&Source)>;
type UpdateFn = Box<dyn FnMut(&NodeProps)>;
type RemoveFn = Box<dyn FnMut()>;
type EventFn = Box<dyn FnMut(&Event)>;

/// Callback registration surface handed to [`Transform::create`].
#[derive(Default)]
pub struct ElementHooks {
    on_new_source: Vec<NewSourceFn>,
    on_update: Vec<UpdateFn>,
    on_remove: Vec<RemoveFn>,
    on_event: Vec<(Option<EventKind>, EventFn)>,
}

impl fmt::Debug for ElementHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementHooks")
            .field("on_new_source", &self.on_new_source.len())
            .field("on_update", &self.on_update.len())
            .field("on_remove", &self.on_remove.len())
            .field("on_event", &self.on_event.len())
            .finish()
    }
}

impl ElementHooks {
    /// Fire whenever the element binds a different source.
    pub fn on_new_source(&mut self, f: impl FnMut(&Source) + 'static) {
        self.on_new_source.push(Box::new(f));
    }

    /// Fire whenever the owning node's props change.
    pub fn on_update(&mut self, f: impl FnMut(&NodeProps) + 'static) {
        self.on_update.push(Box::new(f));
    }

    /// Fire once when the owning node is removed.
    pub fn on_remove(&mut self, f: impl FnMut() + 'static) {
        self.on_remove.push(Box::new(f));
    }

    /// Subscribe to engine events for the element's lifetime; disposed
    /// automatically on removal.
    pub fn on_event(&mut self, kind: Option<EventKind>, f: impl FnMut(&Event) + 'static) {
        self.on_event.push((kind, Box::new(f)));
    }
}

struct ElementCallbacks {
    on_new_source: Vec<NewSourceFn>,
    on_update: Vec<UpdateFn>,
    on_remove: Vec<RemoveFn>,
}

/// A node's concrete render element: the backend handle, the currently
/// bound source, and the lifecycle callbacks keeping them in sync.
pub struct Element {
    node_id: NodeId,
    transform: Rc<dyn Transform>,
    source_type: Option<String>,
    handle: Rc<dyn Any>,
    props: RefCell<NodeProps>,
    bound: RefCell<Option<Source>>,
    callbacks: RefCell<ElementCallbacks>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("node_id", &self.node_id)
            .field("transform", &self.transform.name())
            .field("source_type", &self.source_type)
            .field("bound", &self.bound.borrow().as_ref().map(|s| s.id.clone()))
            .finish()
    }
}

impl Element {
    /// The owning node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Name of the transform that created this element.
    pub fn transform_name(&self) -> &str {
        self.transform.name()
    }

    /// The backend-opaque root handle.
    pub fn handle(&self) -> Rc<dyn Any> {
        Rc::clone(&self.handle)
    }

    /// The currently bound source, if any.
    pub fn source(&self) -> Option<Source> {
        self.bound.borrow().clone()
    }

    // The callback vector is moved out for the duration of each invocation
    // so a callback may write back into the engine (and re-enter this
    // element) without tripping the borrow. A re-entered fire_* sees an
    // empty vector and does nothing.
    fn fire_new_source(&self, source: &Source) {
        *self.bound.borrow_mut() = Some(source.clone());
        let mut cbs = std::mem::take(&mut self.callbacks.borrow_mut().on_new_source);
        for cb in &mut cbs {
            cb(source);
        }
        self.callbacks.borrow_mut().on_new_source = cbs;
    }

    fn fire_update(&self, props: &NodeProps) {
        *self.props.borrow_mut() = props.clone();
        let mut cbs = std::mem::take(&mut self.callbacks.borrow_mut().on_update);
        for cb in &mut cbs {
            cb(props);
        }
        self.callbacks.borrow_mut().on_update = cbs;
    }

    fn fire_remove(&self) {
        let mut cbs = std::mem::take(&mut self.callbacks.borrow_mut().on_remove);
        for cb in &mut cbs {
            cb();
        }
        self.callbacks.borrow_mut().on_remove = cbs;
    }
}

/// Transform declarations plus the default source-type mapping.
#[derive(Default)]
pub(crate) struct TransformRegistry {
    transforms: HashMap<String, Rc<dyn Transform>>,
    default_by_type: HashMap<String, String>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransformRegistry {
    pub(crate) fn register(&mut self, transform: Rc<dyn Transform>) -> LivecompResult<()> {
        let name = transform.name().to_owned();
        if name.is_empty() {
            return Err(LivecompError::registration("transform must declare a name"));
        }
        if self.transforms.contains_key(&name) {
            return Err(LivecompError::registration(format!(
                "transform '{name}' is already registered"
            )));
        }
        if let Some(source_type) = transform.source_type() {
            self.default_by_type
                .entry(source_type.to_owned())
                .or_insert_with(|| name.clone());
        }
        self.transforms.insert(name, transform);
        Ok(())
    }

    /// Resolve which transform applies to a node: explicit `element` name,
    /// then the default mapping for its `source_type`, then a scan for any
    /// transform declaring that type.
    pub(crate) fn resolve(&self, props: &NodeProps) -> LivecompResult<Rc<dyn Transform>> {
        if let Some(name) = &props.element {
            return self
                .transforms
                .get(name)
                .cloned()
                .ok_or_else(|| LivecompError::TransformNotFound(name.clone()));
        }
        if let Some(source_type) = &props.source_type {
            if let Some(name) = self.default_by_type.get(source_type) {
                if let Some(t) = self.transforms.get(name) {
                    return Ok(Rc::clone(t));
                }
            }
            return self
                .transforms
                .values()
                .find(|t| t.source_type() == Some(source_type.as_str()))
                .cloned()
                .ok_or_else(|| LivecompError::TransformNotFound(source_type.clone()));
        }
        Err(LivecompError::TransformNotFound(
            "node declares neither an element nor a source type".to_owned(),
        ))
    }
}

/// Elements keyed by node id and fanned out by source type.
#[derive(Default, Debug)]
pub(crate) struct ElementIndex {
    by_node: HashMap<NodeId, Rc<Element>>,
    by_type: HashMap<String, BTreeSet<NodeId>>,
}

impl ElementIndex {
    fn insert(&mut self, element: Rc<Element>) {
        if let Some(source_type) = &element.source_type {
            self.by_type
                .entry(source_type.clone())
                .or_default()
                .insert(element.node_id.clone());
        }
        self.by_node.insert(element.node_id.clone(), element);
    }

    pub(crate) fn get(&self, node_id: &NodeId) -> Option<Rc<Element>> {
        self.by_node.get(node_id).cloned()
    }

    fn remove(&mut self, node_id: &NodeId) -> Option<Rc<Element>> {
        let element = self.by_node.remove(node_id)?;
        if let Some(source_type) = &element.source_type {
            if let Some(set) = self.by_type.get_mut(source_type) {
                set.remove(node_id);
            }
        }
        Some(element)
    }

    fn of_type(&self, source_type: &str) -> Vec<Rc<Element>> {
        self.by_type
            .get(source_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_node.get(id).cloned())
            .collect()
    }
}

impl CompositorEngine {
    /// Get (or lazily create) the concrete render element for a node.
    ///
    /// On first access the applicable transform is resolved and
    /// instantiated, the element is indexed, and an initial source binding
    /// is attempted. Fails `TransformNotFound` when nothing resolves.
    pub fn element(&self, node: &SceneNode) -> LivecompResult<Rc<Element>> {
        if let Some(cached) = self.inner.elements.borrow().get(&node.id) {
            return Ok(cached);
        }
        let transform = self.inner.transforms.borrow().resolve(&node.props)?;

        let mut hooks = ElementHooks::default();
        let handle = transform.create(&mut hooks, &node.props);

        let source_type = node
            .props
            .source_type
            .clone()
            .or_else(|| transform.source_type().map(str::to_owned));
        let element = Rc::new(Element {
            node_id: node.id.clone(),
            transform,
            source_type,
            handle,
            props: RefCell::new(node.props.clone()),
            bound: RefCell::new(None),
            callbacks: RefCell::new(ElementCallbacks {
                on_new_source: hooks.on_new_source,
                on_update: hooks.on_update,
                on_remove: hooks.on_remove,
            }),
            subscriptions: RefCell::new(Vec::new()),
        });
        for (kind, mut handler) in hooks.on_event {
            let sub = match kind {
                Some(kind) => self.on(kind, move |ev| handler(ev), None),
                None => self.subscribe(move |ev| handler(ev), None),
            };
            element.subscriptions.borrow_mut().push(sub);
        }
        self.inner.elements.borrow_mut().insert(Rc::clone(&element));
        tracing::debug!(
            node = %element.node_id,
            transform = element.transform.name(),
            "element created"
        );

        rebind_element(self, &element);
        Ok(element)
    }
}

/// Re-evaluate one element's binding against the current candidate list.
///
/// `on_new_source` fires only when the resolved source's value differs by
/// identity from the previously bound one; resolving to nothing clears the
/// binding silently.
pub(crate) fn rebind_element(engine: &CompositorEngine, element: &Rc<Element>) {
    let Some(source_type) = element.source_type.clone() else {
        return;
    };
    let props = element.props.borrow().clone();
    let candidates = engine.get_sources(&source_type);
    let resolved: Option<Source> = match element.transform.select_source(&candidates, &props) {
        SourceSelection::Auto => {
            match_source(&candidates, props.source_id.as_ref(), &props.source_props).cloned()
        }
        SourceSelection::Bind(source) => Some(source),
        SourceSelection::None => None,
    };
    let changed = {
        let bound = element.bound.borrow();
        match (bound.as_ref(), resolved.as_ref()) {
            (Some(old), Some(new)) => !old.value.same(&new.value),
            (None, Some(_)) | (Some(_), None) => true,
            (None, None) => false,
        }
    };
    if !changed {
        return;
    }
    match resolved {
        Some(source) => {
            tracing::debug!(node = %element.node_id, source = %source.id, "element rebound");
            element.fire_new_source(&source);
        }
        None => {
            *element.bound.borrow_mut() = None;
        }
    }
}

pub(crate) fn react_sources_changed(engine: &CompositorEngine, source_type: &str) {
    let elements = engine.inner.elements.borrow().of_type(source_type);
    for element in elements {
        rebind_element(engine, &element);
    }
}

pub(crate) fn react_node_changed(engine: &CompositorEngine, node_id: &NodeId) {
    let Some(element) = engine.inner.elements.borrow().get(node_id) else {
        return;
    };
    let Some(props) = engine.inner.index.borrow().props(node_id) else {
        return;
    };
    element.fire_update(&props);
    // A prop change may retarget the binding (e.g. a new explicit source id).
    rebind_element(engine, &element);
}

pub(crate) fn react_node_removed(engine: &CompositorEngine, node_id: &NodeId) {
    // The removed node's subtree is still indexed beneath the tombstone;
    // every element under it dies with its node.
    let mut doomed = vec![node_id.clone()];
    if let Some(subtree) = engine.inner.index.borrow().get(node_id) {
        collect_descendant_ids(&subtree, &mut doomed);
    }
    for id in doomed {
        let Some(element) = engine.inner.elements.borrow_mut().remove(&id) else {
            continue;
        };
        for sub in element.subscriptions.borrow_mut().drain(..) {
            sub.cancel();
        }
        element.fire_remove();
        tracing::debug!(node = %id, "element removed");
    }
}

fn collect_descendant_ids(node: &SceneNode, out: &mut Vec<NodeId>) {
    for child in &node.children {
        out.push(child.id.clone());
        collect_descendant_ids(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        source_type: Option<&'static str>,
    }

    impl Transform for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn source_type(&self) -> Option<&str> {
            self.source_type
        }
        fn create(&self, _hooks: &mut ElementHooks, _props: &NodeProps) -> Rc<dyn Any> {
            Rc::new(())
        }
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let mut reg = TransformRegistry::default();
        reg.register(Rc::new(Fixed {
            name: "Image",
            source_type: None,
        }))
        .unwrap();
        assert!(
            reg.register(Rc::new(Fixed {
                name: "Image",
                source_type: None,
            }))
            .is_err()
        );
    }

    #[test]
    fn explicit_element_name_wins() {
        let mut reg = TransformRegistry::default();
        reg.register(Rc::new(Fixed {
            name: "ByType",
            source_type: Some("Image"),
        }))
        .unwrap();
        reg.register(Rc::new(Fixed {
            name: "Explicit",
            source_type: None,
        }))
        .unwrap();

        let mut props = NodeProps::default();
        props.element = Some("Explicit".into());
        props.source_type = Some("Image".into());
        assert_eq!(reg.resolve(&props).unwrap().name(), "Explicit");
    }

    #[test]
    fn source_type_falls_back_to_declaring_transform() {
        let mut reg = TransformRegistry::default();
        reg.register(Rc::new(Fixed {
            name: "Video",
            source_type: Some("RTCParticipant"),
        }))
        .unwrap();

        let mut props = NodeProps::default();
        props.source_type = Some("RTCParticipant".into());
        assert_eq!(reg.resolve(&props).unwrap().name(), "Video");
    }

    #[test]
    fn unresolvable_node_fails() {
        let reg = TransformRegistry::default();
        let mut props = NodeProps::default();
        props.source_type = Some("Image".into());
        assert!(matches!(
            reg.resolve(&props).unwrap_err(),
            LivecompError::TransformNotFound(_)
        ));
        assert!(matches!(
            reg.resolve(&NodeProps::default()).unwrap_err(),
            LivecompError::TransformNotFound(_)
        ));
    }
}
