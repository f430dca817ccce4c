//! Layout resolution: pure, registered geometry functions.
//!
//! A layout maps a parent's declared layout name and props plus its child
//! list to per-child geometry. Layout functions are side-effect-free and
//! deterministic: the same `(props, children, size)` triple always yields
//! the same result, so a resolution can be re-run at any time. Results are
//! transient and never persisted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::CompositorEngine;
use crate::foundation::error::{LivecompError, LivecompResult};
use crate::foundation::ids::NodeId;
use crate::scene::node::{SceneNode, Size, Vec2};

/// Horizontal/vertical alignment within leftover space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Align {
    /// Pack toward the start edge.
    #[default]
    Start,
    /// Center in the leftover space.
    Center,
    /// Pack toward the end edge.
    End,
}

impl Align {
    fn offset(self, container: f64, content: f64) -> f64 {
        let rem = (container - content).max(0.0);
        match self {
            Self::Start => 0.0,
            Self::Center => rem * 0.5,
            Self::End => rem,
        }
    }
}

/// Parameters accepted by the built-in layouts. Unknown keys pass through
/// `extra` for host-registered layouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutProps {
    /// Gap between cells, pixels.
    pub gap: f64,
    /// Outer margin, pixels.
    pub margin: f64,
    /// Fill each cell entirely instead of insetting by `margin`.
    pub cover: bool,
    /// Fixed grid column count; derived from the child count when absent.
    pub columns: Option<u32>,
    /// Main-axis alignment.
    pub justify: Align,
    /// Cross-axis alignment.
    pub align: Align,
    /// Per-child entry-transition stagger, milliseconds.
    pub stagger_ms: f64,
    /// Opaque extras for host layouts.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for LayoutProps {
    fn default() -> Self {
        Self {
            gap: 0.0,
            margin: 0.0,
            cover: false,
            columns: None,
            justify: Align::Start,
            align: Align::Start,
            stagger_ms: 0.0,
            extra: BTreeMap::new(),
        }
    }
}

impl LayoutProps {
    /// Decode from a node's `layout_props` bag.
    pub fn from_map(map: &BTreeMap<String, Value>) -> LivecompResult<Self> {
        let obj: serde_json::Map<String, Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(obj))
            .map_err(|e| LivecompError::validation(format!("bad layout props: {e}")))
    }
}

/// The slice of a child node a layout is allowed to see.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutChild {
    /// Child node id.
    pub id: NodeId,
    /// Declared size, if any.
    pub size: Option<Size>,
    /// Declared position, if any.
    pub position: Option<Vec2>,
    /// Declared opacity, if any.
    pub opacity: Option<f64>,
}

impl LayoutChild {
    /// Project a scene node down to its layout-relevant fields.
    pub fn from_node(node: &SceneNode) -> Self {
        Self {
            id: node.id.clone(),
            size: node.props.size,
            position: node.props.position,
            opacity: node.props.opacity,
        }
    }
}

/// Timing curve for enter/exit transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingFn {
    /// Constant velocity.
    Linear,
    /// Standard ease.
    #[default]
    Ease,
    /// Accelerate in.
    EaseIn,
    /// Decelerate out.
    EaseOut,
    /// Accelerate then decelerate.
    EaseInOut,
}

/// Enter/exit transition descriptor for one child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildTransition {
    /// Delay before the transition starts, milliseconds.
    pub delay_ms: f64,
    /// Positional offset the child animates from/to.
    pub offset: Vec2,
    /// Scale the child animates from/to.
    pub scale: Vec2,
    /// Opacity the child animates from/to.
    pub opacity: f64,
    /// Timing curve.
    pub timing: TimingFn,
}

impl Default for ChildTransition {
    fn default() -> Self {
        Self {
            delay_ms: 0.0,
            offset: Vec2::default(),
            scale: Vec2::new(1.0, 1.0),
            opacity: 0.0,
            timing: TimingFn::default(),
        }
    }
}

/// Resolved geometry for one child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildPosition {
    /// Top-left position within the parent, pixels.
    pub position: Vec2,
    /// Box size, pixels.
    pub size: Size,
    /// Opacity, 0..1.
    pub opacity: f64,
    /// Corner radius, pixels.
    pub border_radius: f64,
    /// Stacking order within the parent.
    pub z_index: i32,
    /// Entry transition.
    pub entry: ChildTransition,
    /// Exit transition.
    pub exit: ChildTransition,
}

impl ChildPosition {
    fn plain(position: Vec2, size: Size, z_index: i32) -> Self {
        Self {
            position,
            size,
            opacity: 1.0,
            border_radius: 0.0,
            z_index,
            entry: ChildTransition::default(),
            exit: ChildTransition::default(),
        }
    }
}

/// A named, registered layout function.
pub trait Layout {
    /// Registry name.
    fn name(&self) -> &str;

    /// Compute per-child geometry. Must be pure and deterministic.
    fn arrange(
        &self,
        props: &LayoutProps,
        children: &[LayoutChild],
        size: Size,
    ) -> BTreeMap<NodeId, ChildPosition>;
}

/// Registry of layout functions, keyed by name. Duplicate names fail.
pub(crate) struct LayoutRegistry {
    layouts: HashMap<String, Rc<dyn Layout>>,
}

impl fmt::Debug for LayoutRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutRegistry")
            .field("layouts", &self.layouts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LayoutRegistry {
    /// Registry pre-seeded with the built-in layouts.
    pub(crate) fn with_builtins() -> Self {
        let mut reg = Self {
            layouts: HashMap::new(),
        };
        for layout in [
            Rc::new(FreeLayout) as Rc<dyn Layout>,
            Rc::new(RowLayout),
            Rc::new(ColumnLayout),
            Rc::new(GridLayout),
        ] {
            // Built-in names are distinct; a failure here is a programming
            // error in this module.
            let name = layout.name().to_owned();
            reg.layouts.insert(name, layout);
        }
        reg
    }

    pub(crate) fn register(&mut self, layout: Rc<dyn Layout>) -> LivecompResult<()> {
        let name = layout.name().to_owned();
        if name.is_empty() {
            return Err(LivecompError::registration("layout must declare a name"));
        }
        if self.layouts.contains_key(&name) {
            return Err(LivecompError::registration(format!(
                "layout '{name}' is already registered"
            )));
        }
        self.layouts.insert(name, layout);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Rc<dyn Layout>> {
        self.layouts.get(name).cloned()
    }
}

impl CompositorEngine {
    /// Arrange a node's children using its declared layout (`Free` when
    /// none is declared), against the node's declared size.
    ///
    /// Tombstoned children are skipped. Fails validation when the declared
    /// layout name is not registered or the layout props do not decode.
    pub fn arrange(&self, node: &SceneNode) -> LivecompResult<BTreeMap<NodeId, ChildPosition>> {
        let name = node.props.layout.as_deref().unwrap_or("Free");
        let layout = self.inner.layouts.borrow().get(name).ok_or_else(|| {
            LivecompError::validation(format!("layout '{name}' is not registered"))
        })?;
        let props = LayoutProps::from_map(&node.props.layout_props)?;
        let children: Vec<LayoutChild> = node
            .children
            .iter()
            .filter(|c| !c.is_tombstoned())
            .map(LayoutChild::from_node)
            .collect();
        Ok(layout.arrange(&props, &children, node.props.size.unwrap_or_default()))
    }
}

fn staggered(index: usize, props: &LayoutProps) -> ChildTransition {
    ChildTransition {
        delay_ms: index as f64 * props.stagger_ms,
        ..ChildTransition::default()
    }
}

/// Children keep their declared position/size; no arrangement.
pub struct FreeLayout;

impl Layout for FreeLayout {
    fn name(&self) -> &str {
        "Free"
    }

    fn arrange(
        &self,
        props: &LayoutProps,
        children: &[LayoutChild],
        size: Size,
    ) -> BTreeMap<NodeId, ChildPosition> {
        children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let mut pos = ChildPosition::plain(
                    child.position.unwrap_or_default(),
                    child.size.unwrap_or(size),
                    i as i32,
                );
                pos.opacity = child.opacity.unwrap_or(1.0);
                pos.entry = staggered(i, props);
                pos.exit = staggered(i, props);
                (child.id.clone(), pos)
            })
            .collect()
    }
}

fn stack(
    props: &LayoutProps,
    children: &[LayoutChild],
    size: Size,
    horizontal: bool,
) -> BTreeMap<NodeId, ChildPosition> {
    let n = children.len();
    if n == 0 {
        return BTreeMap::new();
    }
    let avail_main = (if horizontal { size.width } else { size.height })
        - 2.0 * props.margin
        - props.gap * (n as f64 - 1.0);
    let cell_main = (avail_main / n as f64).max(0.0);
    let cell_cross =
        ((if horizontal { size.height } else { size.width }) - 2.0 * props.margin).max(0.0);

    children
        .iter()
        .enumerate()
        .map(|(i, child)| {
            let cell_size = if horizontal {
                Size::new(cell_main, cell_cross)
            } else {
                Size::new(cell_cross, cell_main)
            };
            let child_size = child.size.unwrap_or(cell_size);
            let main_origin = props.margin + i as f64 * (cell_main + props.gap);
            let (x, y) = if horizontal {
                (
                    main_origin + props.justify.offset(cell_main, child_size.width),
                    props.margin + props.align.offset(cell_cross, child_size.height),
                )
            } else {
                (
                    props.margin + props.align.offset(cell_cross, child_size.width),
                    main_origin + props.justify.offset(cell_main, child_size.height),
                )
            };
            let mut pos = ChildPosition::plain(Vec2::new(x, y), child_size, i as i32);
            pos.opacity = child.opacity.unwrap_or(1.0);
            pos.entry = staggered(i, props);
            pos.exit = staggered(i, props);
            (child.id.clone(), pos)
        })
        .collect()
}

/// Horizontal stack with gap, margin, and alignment.
pub struct RowLayout;

impl Layout for RowLayout {
    fn name(&self) -> &str {
        "Row"
    }

    fn arrange(
        &self,
        props: &LayoutProps,
        children: &[LayoutChild],
        size: Size,
    ) -> BTreeMap<NodeId, ChildPosition> {
        stack(props, children, size, true)
    }
}

/// Vertical stack with gap, margin, and alignment.
pub struct ColumnLayout;

impl Layout for ColumnLayout {
    fn name(&self) -> &str {
        "Column"
    }

    fn arrange(
        &self,
        props: &LayoutProps,
        children: &[LayoutChild],
        size: Size,
    ) -> BTreeMap<NodeId, ChildPosition> {
        stack(props, children, size, false)
    }
}

/// Near-square grid (or fixed `columns`), row-major cell assignment.
pub struct GridLayout;

impl Layout for GridLayout {
    fn name(&self) -> &str {
        "Grid"
    }

    fn arrange(
        &self,
        props: &LayoutProps,
        children: &[LayoutChild],
        size: Size,
    ) -> BTreeMap<NodeId, ChildPosition> {
        let n = children.len();
        if n == 0 {
            return BTreeMap::new();
        }
        let cols = props
            .columns
            .map(|c| c.max(1) as usize)
            .unwrap_or_else(|| (n as f64).sqrt().ceil() as usize)
            .max(1);
        let rows = n.div_ceil(cols);
        let cell_w = ((size.width - props.gap * (cols as f64 - 1.0)) / cols as f64).max(0.0);
        let cell_h = ((size.height - props.gap * (rows as f64 - 1.0)) / rows as f64).max(0.0);

        children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let col = i % cols;
                let row = i / cols;
                let cell_x = col as f64 * (cell_w + props.gap);
                let cell_y = row as f64 * (cell_h + props.gap);
                let (origin, box_size) = if props.cover {
                    (Vec2::new(cell_x, cell_y), Size::new(cell_w, cell_h))
                } else {
                    (
                        Vec2::new(cell_x + props.margin, cell_y + props.margin),
                        Size::new(
                            (cell_w - 2.0 * props.margin).max(0.0),
                            (cell_h - 2.0 * props.margin).max(0.0),
                        ),
                    )
                };
                let mut pos = ChildPosition::plain(origin, box_size, i as i32);
                pos.opacity = child.opacity.unwrap_or(1.0);
                pos.entry = staggered(i, props);
                pos.exit = staggered(i, props);
                (child.id.clone(), pos)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kids(n: usize) -> Vec<LayoutChild> {
        (0..n)
            .map(|i| LayoutChild {
                id: NodeId::from(format!("c{i}").as_str()),
                size: None,
                position: None,
                opacity: None,
            })
            .collect()
    }

    #[test]
    fn layouts_are_deterministic() {
        let props = LayoutProps {
            gap: 8.0,
            stagger_ms: 50.0,
            ..LayoutProps::default()
        };
        let children = kids(5);
        let size = Size::new(1920.0, 1080.0);
        for layout in [
            &GridLayout as &dyn Layout,
            &RowLayout,
            &ColumnLayout,
            &FreeLayout,
        ] {
            let a = layout.arrange(&props, &children, size);
            let b = layout.arrange(&props, &children, size);
            assert_eq!(a, b, "{} not deterministic", layout.name());
        }
    }

    #[test]
    fn grid_fills_cells_when_covering() {
        let props = LayoutProps {
            cover: true,
            ..LayoutProps::default()
        };
        let out = GridLayout.arrange(&props, &kids(4), Size::new(100.0, 100.0));
        let c3 = &out[&NodeId::from("c3")];
        assert_eq!(c3.position, Vec2::new(50.0, 50.0));
        assert_eq!(c3.size, Size::new(50.0, 50.0));
        assert_eq!(c3.z_index, 3);
    }

    #[test]
    fn grid_respects_fixed_columns() {
        let props = LayoutProps {
            columns: Some(1),
            cover: true,
            ..LayoutProps::default()
        };
        let out = GridLayout.arrange(&props, &kids(3), Size::new(90.0, 90.0));
        assert_eq!(out[&NodeId::from("c1")].position, Vec2::new(0.0, 30.0));
        assert_eq!(out[&NodeId::from("c2")].position, Vec2::new(0.0, 60.0));
    }

    #[test]
    fn row_accounts_for_gap_and_margin() {
        let props = LayoutProps {
            gap: 10.0,
            margin: 5.0,
            ..LayoutProps::default()
        };
        let out = RowLayout.arrange(&props, &kids(2), Size::new(120.0, 60.0));
        // avail = 120 - 2*5 - 10 = 100, cell = 50
        assert_eq!(out[&NodeId::from("c0")].position, Vec2::new(5.0, 5.0));
        assert_eq!(out[&NodeId::from("c0")].size, Size::new(50.0, 50.0));
        assert_eq!(out[&NodeId::from("c1")].position, Vec2::new(65.0, 5.0));
    }

    #[test]
    fn free_layout_passes_declared_geometry_through() {
        let children = vec![LayoutChild {
            id: NodeId::from("a"),
            size: Some(Size::new(10.0, 10.0)),
            position: Some(Vec2::new(3.0, 4.0)),
            opacity: Some(0.5),
        }];
        let out = FreeLayout.arrange(&LayoutProps::default(), &children, Size::new(100.0, 100.0));
        let a = &out[&NodeId::from("a")];
        assert_eq!(a.position, Vec2::new(3.0, 4.0));
        assert_eq!(a.size, Size::new(10.0, 10.0));
        assert_eq!(a.opacity, 0.5);
    }

    #[test]
    fn stagger_delays_scale_with_index() {
        let props = LayoutProps {
            stagger_ms: 80.0,
            ..LayoutProps::default()
        };
        let out = ColumnLayout.arrange(&props, &kids(3), Size::new(100.0, 300.0));
        assert_eq!(out[&NodeId::from("c0")].entry.delay_ms, 0.0);
        assert_eq!(out[&NodeId::from("c2")].entry.delay_ms, 160.0);
    }

    #[test]
    fn engine_arranges_by_declared_layout() {
        use crate::project::MemoryAdapter;
        use crate::scene::node::NodeProps;

        let engine = CompositorEngine::new(MemoryAdapter::new());
        let mut props = NodeProps {
            layout: Some("Grid".into()),
            size: Some(Size::new(100.0, 100.0)),
            ..NodeProps::default()
        };
        props
            .layout_props
            .insert("cover".to_owned(), Value::from(true));
        let node = SceneNode::new("p", props).with_children(vec![
            SceneNode::new("a", NodeProps::default()),
            SceneNode::new("b", NodeProps::default()),
            SceneNode::new("c", NodeProps::default()),
            SceneNode::new("d", NodeProps::default()),
        ]);

        let out = engine.arrange(&node).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[&NodeId::from("d")].position, Vec2::new(50.0, 50.0));

        let mut unknown = node.clone();
        unknown.props.layout = Some("Nope".into());
        assert!(engine.arrange(&unknown).is_err());
    }

    #[test]
    fn layout_props_decode_with_defaults_and_extras() {
        let map = BTreeMap::from([
            ("gap".to_owned(), Value::from(12.0)),
            ("custom".to_owned(), Value::from("x")),
        ]);
        let props = LayoutProps::from_map(&map).unwrap();
        assert_eq!(props.gap, 12.0);
        assert_eq!(props.margin, 0.0);
        assert_eq!(props.extra.get("custom"), Some(&Value::from("x")));
    }
}
