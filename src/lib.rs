//! Livecomp is a live-composition engine: a mutable tree of visual nodes
//! describing a real-time video/graphics scene, kept in sync with external
//! media sources and expanded on demand for a pluggable rendering backend.
//!
//! The public API is handle-oriented:
//!
//! - Build a [`CompositorEngine`] over a persistence [`Adapter`]
//! - Register [`Component`]s, [`SourceProvider`]s, [`Transform`]s, [`Layout`]s
//! - Create or load a [`Project`] and mutate its tree
//! - Resolve nodes into source-bound [`Element`]s and arranged geometry
//!
//! All state is single-threaded; the engine is driven entirely by the
//! host's event loop and every mutation is synchronous end-to-end.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Component system: behaviors attached to node types.
pub mod components;
/// The engine handle and registries.
pub mod engine;
/// Synchronous event bus.
pub mod events;
mod foundation;
/// Layout registry and built-in arrangements.
pub mod layouts;
/// Project handle and the persistence adapter boundary.
pub mod project;
/// Scene tree data model.
pub mod scene;
/// Source registry and binding.
pub mod sources;
/// Transform resolution into render elements.
pub mod transforms;

pub use crate::components::{Component, NodeComponent, NodeContext, RenderHelpers};
pub use crate::engine::CompositorEngine;
pub use crate::events::{Event, EventKind, Subscription};
pub use crate::foundation::error::{LivecompError, LivecompResult};
pub use crate::foundation::ids::{NodeId, ProjectId, SourceId, scoped_id};
pub use crate::layouts::{
    Align, ChildPosition, ChildTransition, Layout, LayoutChild, LayoutProps, TimingFn,
};
pub use crate::project::{
    Adapter, IndexReader, MemoryAdapter, PersistedProject, Project, ProjectStore,
};
pub use crate::scene::node::{
    DataNode, Lifecycle, NodePatch, NodeProps, ObjectFit, SceneNode, Size, Vec2,
};
pub use crate::sources::{NewSource, Source, SourceMethods, SourceProvider, SourceValue};
pub use crate::transforms::{Element, ElementHooks, SourceSelection, Transform};
