//! Source registry: named external data feeds and their lifecycle.
//!
//! Sources (media handles, images, participant feeds) are produced by host
//! providers, not by the scene tree. A provider registers once per source
//! type and receives a bound set of mutators it drives as external media
//! comes and goes; every mutation notifies the rest of the engine through
//! [`crate::events::Event::AvailableSourcesChanged`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::engine::CompositorEngine;
use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::SourceId;

/// Opaque payload a source carries (e.g. a media handle). The rendering
/// backend downcasts it; the engine only compares it by identity.
#[derive(Clone)]
pub struct SourceValue(Rc<dyn Any>);

impl SourceValue {
    /// Wrap a payload.
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Downcast the payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Identity comparison: true when both wrap the same allocation.
    /// This is the rebinding trigger, not structural equality.
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceValue({:p})", Rc::as_ptr(&self.0))
    }
}

/// One live external data feed.
#[derive(Clone, Debug)]
pub struct Source {
    /// Feed identifier, unique across types.
    pub id: SourceId,
    /// Source type (e.g. `"Image"`, `"RTCParticipant"`).
    pub source_type: String,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Whether the feed currently has usable data.
    pub is_active: bool,
    /// Matching/selection properties.
    pub props: BTreeMap<String, Value>,
    /// The payload consumed by the rendering backend.
    pub value: SourceValue,
}

/// Input record for [`SourceMethods::add_source`].
#[derive(Debug)]
pub struct NewSource {
    /// Feed identifier. Must be non-empty.
    pub id: SourceId,
    /// Optional name.
    pub name: Option<String>,
    /// Matching/selection properties.
    pub props: BTreeMap<String, Value>,
    /// Payload.
    pub value: SourceValue,
    /// Initial activity, defaults to true.
    pub is_active: bool,
}

impl NewSource {
    /// A new active source with empty props.
    pub fn new(id: impl Into<SourceId>, value: SourceValue) -> Self {
        Self {
            id: id.into(),
            name: None,
            props: BTreeMap::new(),
            value,
            is_active: true,
        }
    }

    /// Set matching props (builder style).
    pub fn with_props(mut self, props: BTreeMap<String, Value>) -> Self {
        self.props = props;
        self
    }
}

/// A host-registered producer of sources for one type.
///
/// `init` receives mutators scoped to the declared type and is responsible
/// for producing [`Source`] instances over time.
pub trait SourceProvider {
    /// The source type this provider owns.
    fn source_type(&self) -> &str;

    /// Called once at registration with the type-scoped mutators.
    fn init(&self, methods: SourceMethods) {
        let _ = methods;
    }
}

/// Mutators handed to a [`SourceProvider`], scoped to its source type.
#[derive(Clone, Debug)]
pub struct SourceMethods {
    engine: CompositorEngine,
    source_type: String,
}

impl SourceMethods {
    pub(crate) fn new(engine: CompositorEngine, source_type: String) -> Self {
        Self {
            engine,
            source_type,
        }
    }

    /// Register a new source of this provider's type.
    pub fn add_source(&self, source: NewSource) -> LivecompResult<()> {
        self.engine.add_source(&self.source_type, source)
    }

    /// Remove a source.
    pub fn remove_source(&self, id: &SourceId) -> LivecompResult<()> {
        self.engine.remove_source(id)
    }

    /// Shallow-merge props into a source.
    pub fn update_source(&self, id: &SourceId, props: BTreeMap<String, Value>) -> LivecompResult<()> {
        self.engine.update_source(id, props)
    }

    /// Toggle a source's activity flag.
    pub fn set_source_active(&self, id: &SourceId, active: bool) -> LivecompResult<()> {
        self.engine.set_source_active(id, active)
    }
}

/// Registry state: providers plus the per-type and per-id source indices.
#[derive(Default)]
pub(crate) struct SourceRegistry {
    providers: HashMap<String, Rc<dyn SourceProvider>>,
    by_id: HashMap<SourceId, Source>,
    by_type: HashMap<String, Vec<SourceId>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("sources", &self.by_id.len())
            .finish()
    }
}

impl SourceRegistry {
    pub(crate) fn register(&mut self, provider: Rc<dyn SourceProvider>) -> LivecompResult<()> {
        let source_type = provider.source_type().to_owned();
        if source_type.is_empty() {
            return Err(LivecompError::registration(
                "source provider must declare a type",
            ));
        }
        if self.providers.contains_key(&source_type) {
            return Err(LivecompError::registration(format!(
                "source type '{source_type}' is already registered"
            )));
        }
        self.providers.insert(source_type, provider);
        Ok(())
    }

    pub(crate) fn add(&mut self, source_type: &str, source: NewSource) -> LivecompResult<()> {
        if source.id.as_str().is_empty() {
            return Err(LivecompError::validation("source id must be non-empty"));
        }
        if self.by_id.contains_key(&source.id) {
            return Err(LivecompError::validation(format!(
                "source '{}' already exists",
                source.id
            )));
        }
        let id = source.id.clone();
        self.by_id.insert(
            id.clone(),
            Source {
                id: id.clone(),
                source_type: source_type.to_owned(),
                name: source.name,
                is_active: source.is_active,
                props: source.props,
                value: source.value,
            },
        );
        self.by_type
            .entry(source_type.to_owned())
            .or_default()
            .push(id);
        Ok(())
    }

    /// Shallow-merge props; returns the source's type for event emission.
    pub(crate) fn update(
        &mut self,
        id: &SourceId,
        props: BTreeMap<String, Value>,
    ) -> LivecompResult<String> {
        let source = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| LivecompError::validation(format!("unknown source '{id}'")))?;
        for (k, v) in props {
            source.props.insert(k, v);
        }
        Ok(source.source_type.clone())
    }

    pub(crate) fn set_active(&mut self, id: &SourceId, active: bool) -> LivecompResult<String> {
        let source = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| LivecompError::validation(format!("unknown source '{id}'")))?;
        source.is_active = active;
        Ok(source.source_type.clone())
    }

    pub(crate) fn remove(&mut self, id: &SourceId) -> LivecompResult<String> {
        let source = self
            .by_id
            .remove(id)
            .ok_or_else(|| LivecompError::validation(format!("unknown source '{id}'")))?;
        if let Some(list) = self.by_type.get_mut(&source.source_type) {
            list.retain(|s| s != id);
        }
        Ok(source.source_type)
    }

    pub(crate) fn get(&self, id: &SourceId) -> Option<Source> {
        self.by_id.get(id).cloned()
    }

    pub(crate) fn of_type(&self, source_type: &str) -> Vec<Source> {
        self.by_type
            .get(source_type)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }
}

/// Pick the source a node should bind to from a candidate list.
///
/// Exact id match wins. Otherwise candidates whose props subset-match the
/// node's declared `source_props` are considered, preferring the first
/// active one and falling back to the first match.
pub(crate) fn match_source<'a>(
    candidates: &'a [Source],
    source_id: Option<&SourceId>,
    source_props: &BTreeMap<String, Value>,
) -> Option<&'a Source> {
    if let Some(want) = source_id {
        if let Some(exact) = candidates.iter().find(|s| &s.id == want) {
            return Some(exact);
        }
    }
    let matches: Vec<&Source> = candidates
        .iter()
        .filter(|s| source_props.iter().all(|(k, v)| s.props.get(k) == Some(v)))
        .collect();
    matches
        .iter()
        .find(|s| s.is_active)
        .copied()
        .or_else(|| matches.first().copied())
}
