mod component_system {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use serde_json::Value;

    use livecomp::{
        Component, CompositorEngine, LivecompResult, MemoryAdapter, NodeContext, NodeProps,
        RenderHelpers, SceneNode,
    };

    fn engine() -> CompositorEngine {
        CompositorEngine::new(MemoryAdapter::new())
    }

    struct Counter;

    impl Component for Counter {
        fn name(&self) -> &str {
            "Counter"
        }
        fn commands(&self) -> Vec<String> {
            vec!["bump".into()]
        }
        fn queries(&self) -> Vec<String> {
            vec!["count".into()]
        }
        fn create(&self, mut props: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
            props.entry("count".to_owned()).or_insert(Value::from(0));
            props
        }
        fn execute(&self, ctx: &NodeContext, command: &str, _args: Value) -> LivecompResult<Value> {
            match command {
                "bump" => {
                    let next = ctx
                        .props()?
                        .component_props
                        .get("count")
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                        + 1;
                    ctx.update(BTreeMap::from([("count".to_owned(), Value::from(next))]))?;
                    Ok(Value::from(next))
                }
                _ => Ok(Value::Null),
            }
        }
        fn query(&self, ctx: &NodeContext, query: &str, _args: Value) -> LivecompResult<Value> {
            match query {
                "count" => Ok(ctx
                    .props()?
                    .component_props
                    .get("count")
                    .cloned()
                    .unwrap_or(Value::Null)),
                _ => Ok(Value::Null),
            }
        }
    }

    #[test]
    fn commands_mutate_state_through_the_context() {
        let engine = engine();
        engine.register_component(Rc::new(Counter)).unwrap();
        let project = engine.create_project().unwrap();
        let props = engine
            .create_component("Counter", BTreeMap::new(), None)
            .unwrap();
        let node = project.insert(props, None, None).unwrap();

        let surface = engine.node_component(&node).unwrap();
        let changes = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&changes);
        let sub = surface.context().on_change(move |_| *sink.borrow_mut() += 1);

        assert_eq!(surface.execute("bump", Value::Null).unwrap(), Value::from(1));
        // globally addressed dispatch reaches the same state
        assert_eq!(
            engine
                .execute_command("Counter.bump", &node, Value::Null)
                .unwrap(),
            Value::from(2)
        );
        assert_eq!(surface.query("count", Value::Null).unwrap(), Value::from(2));
        assert_eq!(*changes.borrow(), 2);

        sub.cancel();
        surface.execute("bump", Value::Null).unwrap();
        assert_eq!(*changes.borrow(), 2);
    }

    #[test]
    fn unregistered_types_get_an_inert_surface() {
        let engine = engine();
        let project = engine.create_project().unwrap();
        let node = project
            .insert(NodeProps::of_component("Mystery"), None, None)
            .unwrap();

        let surface = engine.node_component(&node).unwrap();
        assert!(!surface.is_registered());
        assert_eq!(surface.execute("anything", Value::Null).unwrap(), Value::Null);
        assert_eq!(surface.query("anything", Value::Null).unwrap(), Value::Null);
        // render is identity
        assert_eq!(surface.render().unwrap().id, node);
    }

    #[test]
    fn create_component_requires_a_registered_type_and_seeds_sources() {
        let engine = engine();

        struct Feed;
        impl Component for Feed {
            fn name(&self) -> &str {
                "Feed"
            }
            fn sources(&self) -> Vec<String> {
                vec!["Image".into(), "RTCParticipant".into()]
            }
        }
        engine.register_component(Rc::new(Feed)).unwrap();

        assert!(engine.create_component("Nope", BTreeMap::new(), None).is_err());

        let props = engine.create_component("Feed", BTreeMap::new(), None).unwrap();
        assert_eq!(props.component.as_deref(), Some("Feed"));
        assert_eq!(props.sources.get("Image"), Some(&Vec::new()));
        assert_eq!(props.sources.get("RTCParticipant"), Some(&Vec::new()));
    }

    struct Layered;

    impl Component for Layered {
        fn name(&self) -> &str {
            "Layered"
        }
        fn render(&self, ctx: &NodeContext, helpers: &RenderHelpers) -> LivecompResult<SceneNode> {
            let node = ctx.node()?;
            let background = helpers.node("background", NodeProps::default());
            let mut content = helpers.node("content", NodeProps::default());
            content.props.component_props = node.props.component_props.clone();
            let foreground = helpers.node("foreground", NodeProps::default());
            Ok(SceneNode::new(node.id.clone(), node.props.clone())
                .with_children(vec![background, content, foreground]))
        }
    }

    #[test]
    fn render_expansion_is_idempotent() {
        let engine = engine();
        engine.register_component(Rc::new(Layered)).unwrap();
        let project = engine.create_project().unwrap();
        project
            .insert(NodeProps::of_component("Layered"), None, None)
            .unwrap();

        let first = engine.render_tree(project.id()).unwrap();
        let second = engine.render_tree(project.id()).unwrap();
        assert_eq!(first, second);

        let labels: Vec<&str> = first
            .children
            .iter()
            .map(|c| c.id.as_str().split('.').next().unwrap())
            .collect();
        assert_eq!(labels, ["background", "content", "foreground"]);
    }
}
