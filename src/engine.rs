//! The engine handle: one explicit instance per process (or per test),
//! passed by reference to every subsystem. There is no global singleton.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::components::{Component, ComponentRegistry};
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::foundation::error::LivecompResult;
use crate::foundation::ids::{IdAllocator, ProjectId, SourceId};
use crate::layouts::{Layout, LayoutRegistry};
use crate::project::{Adapter, ProjectStore};
use crate::sources::{NewSource, Source, SourceMethods, SourceProvider, SourceRegistry};
use crate::transforms::{ElementIndex, Transform, TransformRegistry};

pub(crate) struct EngineInner {
    pub(crate) index: RefCell<crate::scene::index::NodeIndex>,
    pub(crate) bus: EventBus,
    pub(crate) components: RefCell<ComponentRegistry>,
    pub(crate) sources: RefCell<SourceRegistry>,
    pub(crate) transforms: RefCell<TransformRegistry>,
    pub(crate) elements: RefCell<ElementIndex>,
    pub(crate) layouts: RefCell<LayoutRegistry>,
    pub(crate) ids: IdAllocator,
    pub(crate) adapter: Box<dyn Adapter>,
    pub(crate) stores: RefCell<HashMap<ProjectId, Rc<RefCell<Box<dyn ProjectStore>>>>>,
}

/// Handle over one live-composition engine instance.
///
/// Cheap to clone (shared reference). All state is single-threaded; the
/// engine is driven entirely by the host's event loop and provides no
/// internal locking or parallelism.
#[derive(Clone)]
pub struct CompositorEngine {
    pub(crate) inner: Rc<EngineInner>,
}

impl fmt::Debug for CompositorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositorEngine")
            .field("sources", &self.inner.sources.borrow())
            .field("layouts", &self.inner.layouts.borrow())
            .finish()
    }
}

impl CompositorEngine {
    /// Build an engine over a persistence adapter and wire the internal
    /// reactions (transform rebinding and element lifecycle).
    pub fn new(adapter: impl Adapter + 'static) -> Self {
        let engine = Self {
            inner: Rc::new(EngineInner {
                index: RefCell::new(crate::scene::index::NodeIndex::new()),
                bus: EventBus::new(),
                components: RefCell::new(ComponentRegistry::default()),
                sources: RefCell::new(SourceRegistry::default()),
                transforms: RefCell::new(TransformRegistry::default()),
                elements: RefCell::new(ElementIndex::default()),
                layouts: RefCell::new(LayoutRegistry::with_builtins()),
                ids: IdAllocator::new(),
                adapter: Box::new(adapter),
                stores: RefCell::new(HashMap::new()),
            }),
        };
        engine.wire_reactions();
        engine
    }

    // The resolver follows live data through the bus, same as any host
    // listener. Handlers hold a weak reference so the bus never keeps the
    // engine alive.
    fn wire_reactions(&self) {
        let weak = Rc::downgrade(&self.inner);

        let w = weak.clone();
        self.inner.bus.on(
            EventKind::AvailableSourcesChanged,
            move |ev| {
                let Some(inner) = w.upgrade() else { return };
                if let Event::AvailableSourcesChanged { source_type } = ev {
                    crate::transforms::react_sources_changed(
                        &CompositorEngine { inner },
                        source_type,
                    );
                }
            },
            None,
        );

        let w = weak.clone();
        self.inner.bus.on(
            EventKind::SourceChanged,
            move |ev| {
                let Some(inner) = w.upgrade() else { return };
                if let Event::SourceChanged { source_type, .. } = ev {
                    crate::transforms::react_sources_changed(
                        &CompositorEngine { inner },
                        source_type,
                    );
                }
            },
            None,
        );

        let w = weak.clone();
        self.inner.bus.on(
            EventKind::NodeChanged,
            move |ev| {
                let Some(inner) = w.upgrade() else { return };
                if let Event::NodeChanged { node_id, .. } = ev {
                    crate::transforms::react_node_changed(&CompositorEngine { inner }, node_id);
                }
            },
            None,
        );

        let w = weak;
        self.inner.bus.on(
            EventKind::NodeRemoved,
            move |ev| {
                let Some(inner) = w.upgrade() else { return };
                if let Event::NodeRemoved { node_id, .. } = ev {
                    crate::transforms::react_node_removed(&CompositorEngine { inner }, node_id);
                }
            },
            None,
        );
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// Register one component behavior. Duplicate names fail.
    pub fn register_component(&self, component: Rc<dyn Component>) -> LivecompResult<()> {
        self.inner.components.borrow_mut().register(component)
    }

    /// Register several components; stops at the first failure.
    pub fn register_components(
        &self,
        components: Vec<Rc<dyn Component>>,
    ) -> LivecompResult<()> {
        for c in components {
            self.register_component(c)?;
        }
        Ok(())
    }

    /// Register a source provider and invoke its `init` hook with mutators
    /// scoped to its type.
    pub fn register_source(&self, provider: Rc<dyn SourceProvider>) -> LivecompResult<()> {
        let source_type = provider.source_type().to_owned();
        self.inner.sources.borrow_mut().register(Rc::clone(&provider))?;
        tracing::debug!(source_type, "source provider registered");
        provider.init(SourceMethods::new(self.clone(), source_type));
        Ok(())
    }

    /// Register several source providers; stops at the first failure.
    pub fn register_sources(&self, providers: Vec<Rc<dyn SourceProvider>>) -> LivecompResult<()> {
        for p in providers {
            self.register_source(p)?;
        }
        Ok(())
    }

    /// Register one transform. Duplicate names fail.
    pub fn register_transform(&self, transform: Rc<dyn Transform>) -> LivecompResult<()> {
        self.inner.transforms.borrow_mut().register(transform)
    }

    /// Register several transforms; stops at the first failure.
    pub fn register_transforms(&self, transforms: Vec<Rc<dyn Transform>>) -> LivecompResult<()> {
        for t in transforms {
            self.register_transform(t)?;
        }
        Ok(())
    }

    /// Register one layout. Duplicate names fail.
    pub fn register_layout(&self, layout: Rc<dyn Layout>) -> LivecompResult<()> {
        self.inner.layouts.borrow_mut().register(layout)
    }

    /// Register several layouts; stops at the first failure.
    pub fn register_layouts(&self, layouts: Vec<Rc<dyn Layout>>) -> LivecompResult<()> {
        for l in layouts {
            self.register_layout(l)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event surface
    // ------------------------------------------------------------------

    /// Subscribe to every engine event, optionally filtered to one node.
    pub fn subscribe(
        &self,
        handler: impl FnMut(&Event) + 'static,
        node: Option<crate::foundation::ids::NodeId>,
    ) -> Subscription {
        self.inner.bus.subscribe(handler, node)
    }

    /// Subscribe to one event kind, optionally filtered to one node.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl FnMut(&Event) + 'static,
        node: Option<crate::foundation::ids::NodeId>,
    ) -> Subscription {
        self.inner.bus.on(kind, handler, node)
    }

    pub(crate) fn emit(&self, event: &Event) {
        self.inner.bus.emit(event);
    }

    // ------------------------------------------------------------------
    // Source lifecycle (also reachable through [`SourceMethods`])
    // ------------------------------------------------------------------

    /// Current sources of a type; empty when none.
    pub fn get_sources(&self, source_type: &str) -> Vec<Source> {
        self.inner.sources.borrow().of_type(source_type)
    }

    /// Look up one source by id.
    pub fn get_source(&self, id: &SourceId) -> Option<Source> {
        self.inner.sources.borrow().get(id)
    }

    /// Add a source of `source_type`.
    pub fn add_source(&self, source_type: &str, source: NewSource) -> LivecompResult<()> {
        self.inner.sources.borrow_mut().add(source_type, source)?;
        tracing::debug!(source_type, "source added");
        self.emit(&Event::AvailableSourcesChanged {
            source_type: source_type.to_owned(),
        });
        Ok(())
    }

    /// Shallow-merge props into a source.
    pub fn update_source(
        &self,
        id: &SourceId,
        props: BTreeMap<String, Value>,
    ) -> LivecompResult<()> {
        let source_type = self.inner.sources.borrow_mut().update(id, props)?;
        self.emit(&Event::SourceChanged {
            source_type: source_type.clone(),
            source_id: id.clone(),
        });
        self.emit(&Event::AvailableSourcesChanged { source_type });
        Ok(())
    }

    /// Toggle a source's activity flag.
    pub fn set_source_active(&self, id: &SourceId, active: bool) -> LivecompResult<()> {
        let source_type = self.inner.sources.borrow_mut().set_active(id, active)?;
        tracing::debug!(source = %id, active, "source activity changed");
        self.emit(&Event::AvailableSourcesChanged { source_type });
        Ok(())
    }

    /// Remove a source from both indices.
    pub fn remove_source(&self, id: &SourceId) -> LivecompResult<()> {
        let source_type = self.inner.sources.borrow_mut().remove(id)?;
        self.emit(&Event::AvailableSourcesChanged { source_type });
        Ok(())
    }
}
