//! Node data model: typed props, patches, and the tree/flat node forms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::foundation::ids::NodeId;

/// 2D point/offset in canvas pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f64,
    /// Vertical component.
    pub y: f64,
}

impl Vec2 {
    /// Construct a point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// 2D extent in canvas pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: f64,
    /// Height in pixels.
    pub height: f64,
}

impl Size {
    /// Construct a size.
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// How a source's media is fitted into its node's box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectFit {
    /// Fill the box, cropping overflow.
    #[default]
    Cover,
    /// Fit entirely inside the box, letterboxing.
    Contain,
    /// Stretch to the box, ignoring aspect ratio.
    Fill,
    /// Keep intrinsic size.
    None,
}

/// Node lifecycle state.
///
/// Removed nodes are tombstoned rather than deleted so in-flight readers
/// racing a removal never observe a dangling id. Reaping tombstones is an
/// explicit, host-driven step ([`crate::project::Project::reap`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifecycle {
    /// Live node.
    #[default]
    Active,
    /// Detached from its parent, retained in the index.
    Tombstoned,
}

impl Lifecycle {
    /// True if the node is live.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

// Serialized as the `_deleted` tombstone flag.
impl Serialize for Lifecycle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(!self.is_active())
    }
}

impl<'de> Deserialize<'de> for Lifecycle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(if bool::deserialize(deserializer)? {
            Self::Tombstoned
        } else {
            Self::Active
        })
    }
}

/// Declared properties of a scene node.
///
/// Recognized fields are typed; anything else round-trips through `extra`
/// untouched, so hosts and render expansion can carry opaque data on nodes
/// without the engine knowing about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    /// Declared component type (the `type` key).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// Explicit transform (element) name, overriding source-type resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,

    /// Source type this node binds to (e.g. `"Image"`, `"RTCParticipant"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Exact source id to bind, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<crate::foundation::ids::SourceId>,
    /// Properties a candidate source must subset-match to bind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_props: BTreeMap<String, Value>,

    /// Layout name arranging this node's children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    /// Parameters for the layout function.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layout_props: BTreeMap<String, Value>,

    /// Declared size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    /// Declared position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    /// Declared opacity, 0..1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    /// Media fitting mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_fit: Option<ObjectFit>,

    /// Component-owned state, normalized by the component's `create`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub component_props: BTreeMap<String, Value>,
    /// Per-source-type declarations seeded by component creation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, Vec<Value>>,

    /// Opaque passthrough fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl NodeProps {
    /// Props declaring a component type.
    pub fn of_component(component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..Self::default()
        }
    }

    /// Shallow-merge a patch into these props.
    ///
    /// `Some` fields replace wholesale; map fields in the patch replace the
    /// whole map (key-wise merging is the caller's job, see
    /// [`crate::components::NodeContext::update`]); `extra` merges key-wise.
    pub fn merge(&mut self, patch: NodePatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = patch.$field {
                    self.$field = v;
                })*
            };
        }
        take!(component, element, source_type, source_id, layout, size, position, opacity, object_fit);
        if let Some(v) = patch.source_props {
            self.source_props = v;
        }
        if let Some(v) = patch.layout_props {
            self.layout_props = v;
        }
        if let Some(v) = patch.component_props {
            self.component_props = v;
        }
        if let Some(v) = patch.sources {
            self.sources = v;
        }
        for (k, v) in patch.extra {
            self.extra.insert(k, v);
        }
    }
}

/// Shallow patch over [`NodeProps`].
///
/// Every recognized field is optional; absent fields leave the node
/// untouched. Note the double-`Option` on fields that are themselves
/// optional: `Some(None)` clears, `None` leaves as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    /// New component type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Option<String>>,
    /// New explicit transform name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Option<String>>,
    /// New source type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<Option<String>>,
    /// New exact source id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Option<crate::foundation::ids::SourceId>>,
    /// Replacement source-matching props.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_props: Option<BTreeMap<String, Value>>,
    /// New layout name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Option<String>>,
    /// Replacement layout params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_props: Option<BTreeMap<String, Value>>,
    /// New size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Option<Size>>,
    /// New position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Option<Vec2>>,
    /// New opacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<Option<f64>>,
    /// New fitting mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_fit: Option<Option<ObjectFit>>,
    /// Replacement component state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_props: Option<BTreeMap<String, Value>>,
    /// Replacement per-type source declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<BTreeMap<String, Vec<Value>>>,
    /// Extra fields merged key-wise.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl NodePatch {
    /// Patch replacing the component-owned state map.
    pub fn component_props(props: BTreeMap<String, Value>) -> Self {
        Self {
            component_props: Some(props),
            ..Self::default()
        }
    }

    /// Patch retargeting the node at an exact source id.
    pub fn source_id(id: impl Into<crate::foundation::ids::SourceId>) -> Self {
        Self {
            source_id: Some(Some(id.into())),
            ..Self::default()
        }
    }
}

/// One unit of the scene tree, with children inlined.
///
/// The `children` order is authoritative; no two children of one parent
/// share an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    /// Node identifier, unique within the project.
    pub id: NodeId,
    /// Declared properties.
    pub props: NodeProps,
    /// Ordered children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SceneNode>,
    /// Tombstone flag.
    #[serde(rename = "_deleted", default, skip_serializing_if = "Lifecycle::is_active")]
    pub lifecycle: Lifecycle,
}

impl SceneNode {
    /// Build a leaf node.
    pub fn new(id: impl Into<NodeId>, props: NodeProps) -> Self {
        Self {
            id: id.into(),
            props,
            children: Vec::new(),
            lifecycle: Lifecycle::Active,
        }
    }

    /// Attach children, consuming self (builder style).
    pub fn with_children(mut self, children: Vec<SceneNode>) -> Self {
        self.children = children;
        self
    }

    /// True once the node has been removed from the tree.
    pub fn is_tombstoned(&self) -> bool {
        !self.lifecycle.is_active()
    }

    /// Flatten to the persistence form. Lossless for id and props.
    pub fn to_data(&self) -> DataNode {
        DataNode {
            id: self.id.clone(),
            props: self.props.clone(),
            child_ids: self.children.iter().map(|c| c.id.clone()).collect(),
        }
    }
}

/// Flattened persistence form of a node: children by reference.
///
/// Used only at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    /// Node identifier.
    pub id: NodeId,
    /// Declared properties.
    pub props: NodeProps,
    /// Ordered child ids.
    #[serde(default)]
    pub child_ids: Vec<NodeId>,
}
