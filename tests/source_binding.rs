mod source_binding {
    use std::any::Any;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use serde_json::Value;

    use livecomp::{
        CompositorEngine, ElementHooks, EventKind, MemoryAdapter, NewSource, NodeId, NodePatch,
        NodeProps, Project, SourceId, SourceMethods, SourceProvider, SourceValue, Transform,
    };

    fn init_logs() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    struct ImageProvider {
        methods: Rc<RefCell<Option<SourceMethods>>>,
    }

    impl SourceProvider for ImageProvider {
        fn source_type(&self) -> &str {
            "Image"
        }
        fn init(&self, methods: SourceMethods) {
            *self.methods.borrow_mut() = Some(methods);
        }
    }

    #[derive(Default)]
    struct Recorder {
        bound: RefCell<Vec<SourceId>>,
        removed: RefCell<u32>,
        source_events: RefCell<u32>,
    }

    struct ImageTransform {
        recorder: Rc<Recorder>,
    }

    impl Transform for ImageTransform {
        fn name(&self) -> &str {
            "ImageElement"
        }
        fn source_type(&self) -> Option<&str> {
            Some("Image")
        }
        fn create(&self, hooks: &mut ElementHooks, _props: &NodeProps) -> Rc<dyn Any> {
            let recorder = Rc::clone(&self.recorder);
            hooks.on_new_source(move |source| {
                recorder.bound.borrow_mut().push(source.id.clone());
            });
            let recorder = Rc::clone(&self.recorder);
            hooks.on_remove(move || *recorder.removed.borrow_mut() += 1);
            let recorder = Rc::clone(&self.recorder);
            hooks.on_event(Some(EventKind::AvailableSourcesChanged), move |_| {
                *recorder.source_events.borrow_mut() += 1;
            });
            Rc::new("image-element")
        }
    }

    struct Rig {
        engine: CompositorEngine,
        project: Project,
        methods: SourceMethods,
        recorder: Rc<Recorder>,
    }

    fn rig() -> Rig {
        init_logs();
        let engine = CompositorEngine::new(MemoryAdapter::new());
        let methods = Rc::new(RefCell::new(None));
        engine
            .register_source(Rc::new(ImageProvider {
                methods: Rc::clone(&methods),
            }))
            .unwrap();
        let recorder = Rc::new(Recorder::default());
        engine
            .register_transform(Rc::new(ImageTransform {
                recorder: Rc::clone(&recorder),
            }))
            .unwrap();
        let project = engine.create_project().unwrap();
        let methods = methods.borrow_mut().take().unwrap();
        Rig {
            engine,
            project,
            methods,
            recorder,
        }
    }

    fn logo_node() -> NodeProps {
        NodeProps {
            source_type: Some("Image".into()),
            source_props: BTreeMap::from([("src".to_owned(), Value::from("logo.png"))]),
            ..NodeProps::default()
        }
    }

    fn image(id: &str, src: &str) -> NewSource {
        NewSource::new(id, SourceValue::new(src.to_owned()))
            .with_props(BTreeMap::from([("src".to_owned(), Value::from(src))]))
    }

    #[test]
    fn a_late_source_binds_the_waiting_element_exactly_once() {
        let rig = rig();
        let node = rig.project.insert(logo_node(), None, None).unwrap();
        let element = rig.engine.element(&rig.project.get(&node).unwrap()).unwrap();

        // nothing to bind yet
        assert!(element.source().is_none());
        assert!(rig.recorder.bound.borrow().is_empty());

        rig.methods.add_source(image("s1", "logo.png")).unwrap();
        assert_eq!(&*rig.recorder.bound.borrow(), &[SourceId::from("s1")]);
        assert_eq!(element.source().unwrap().id, SourceId::from("s1"));
        assert_eq!(
            element.handle().downcast_ref::<&str>(),
            Some(&"image-element")
        );

        // a second matching candidate does not steal the binding
        rig.methods.add_source(image("s2", "logo.png")).unwrap();
        assert_eq!(rig.recorder.bound.borrow().len(), 1);

        // nor does a props update that leaves resolution unchanged
        rig.methods
            .update_source(
                &SourceId::from("s1"),
                BTreeMap::from([("quality".to_owned(), Value::from("hd"))]),
            )
            .unwrap();
        assert_eq!(rig.recorder.bound.borrow().len(), 1);
    }

    #[test]
    fn retargeting_the_node_rebinds_once() {
        let rig = rig();
        let node = rig.project.insert(logo_node(), None, None).unwrap();
        rig.engine.element(&rig.project.get(&node).unwrap()).unwrap();
        rig.methods.add_source(image("s1", "logo.png")).unwrap();
        rig.methods.add_source(image("s2", "logo.png")).unwrap();
        assert_eq!(&*rig.recorder.bound.borrow(), &[SourceId::from("s1")]);

        rig.project.update(&node, NodePatch::source_id("s2")).unwrap();
        assert_eq!(
            &*rig.recorder.bound.borrow(),
            &[SourceId::from("s1"), SourceId::from("s2")]
        );
    }

    #[test]
    fn deactivation_falls_back_to_the_next_candidate() {
        let rig = rig();
        let node = rig.project.insert(logo_node(), None, None).unwrap();
        rig.engine.element(&rig.project.get(&node).unwrap()).unwrap();
        rig.methods.add_source(image("s1", "logo.png")).unwrap();
        rig.methods.add_source(image("s2", "logo.png")).unwrap();

        rig.methods
            .set_source_active(&SourceId::from("s1"), false)
            .unwrap();
        assert_eq!(
            &*rig.recorder.bound.borrow(),
            &[SourceId::from("s1"), SourceId::from("s2")]
        );
    }

    #[test]
    fn node_removal_disposes_the_element_and_its_subscriptions() {
        let rig = rig();
        let node = rig.project.insert(logo_node(), None, None).unwrap();
        rig.engine.element(&rig.project.get(&node).unwrap()).unwrap();
        rig.methods.add_source(image("s1", "logo.png")).unwrap();
        let events_before = *rig.recorder.source_events.borrow();
        assert!(events_before > 0);

        rig.project.remove(&node).unwrap();
        assert_eq!(*rig.recorder.removed.borrow(), 1);

        // the on_event subscription is gone with the element
        rig.methods.add_source(image("s3", "other.png")).unwrap();
        assert_eq!(*rig.recorder.source_events.borrow(), events_before);
        // and no rebinding happens for the dead node
        assert_eq!(&*rig.recorder.bound.borrow(), &[SourceId::from("s1")]);
    }

    #[test]
    fn removing_a_group_disposes_descendant_elements() {
        let rig = rig();
        let group = rig.project.insert(NodeProps::default(), None, None).unwrap();
        let leaf = rig.project.insert(logo_node(), Some(&group), None).unwrap();
        rig.engine.element(&rig.project.get(&leaf).unwrap()).unwrap();
        rig.methods.add_source(image("s1", "logo.png")).unwrap();
        assert_eq!(&*rig.recorder.bound.borrow(), &[SourceId::from("s1")]);

        rig.project.remove(&group).unwrap();
        assert_eq!(*rig.recorder.removed.borrow(), 1);
        rig.project.reap().unwrap();

        // the leaf's element no longer tracks sources
        let events_after_removal = *rig.recorder.source_events.borrow();
        rig.methods.add_source(image("s2", "logo.png")).unwrap();
        assert_eq!(*rig.recorder.source_events.borrow(), events_after_removal);
        assert_eq!(&*rig.recorder.bound.borrow(), &[SourceId::from("s1")]);
    }

    struct Syncing {
        target: Rc<RefCell<Option<(Project, NodeId)>>>,
        updates: Rc<RefCell<u32>>,
    }

    impl Transform for Syncing {
        fn name(&self) -> &str {
            "Syncing"
        }
        fn create(&self, hooks: &mut ElementHooks, _props: &NodeProps) -> Rc<dyn Any> {
            let target = Rc::clone(&self.target);
            let updates = Rc::clone(&self.updates);
            hooks.on_update(move |props| {
                *updates.borrow_mut() += 1;
                if props.extra.get("synced") != Some(&Value::from(true)) {
                    if let Some((project, node)) = target.borrow().clone() {
                        let mut patch = NodePatch::default();
                        patch.extra.insert("synced".to_owned(), Value::from(true));
                        project.update(&node, patch).unwrap();
                    }
                }
            });
            Rc::new(())
        }
    }

    #[test]
    fn an_update_reactor_may_write_back_through_the_project() {
        init_logs();
        let engine = CompositorEngine::new(MemoryAdapter::new());
        let target = Rc::new(RefCell::new(None));
        let updates = Rc::new(RefCell::new(0u32));
        engine
            .register_transform(Rc::new(Syncing {
                target: Rc::clone(&target),
                updates: Rc::clone(&updates),
            }))
            .unwrap();
        let project = engine.create_project().unwrap();

        let mut props = NodeProps::default();
        props.element = Some("Syncing".into());
        let node = project.insert(props, None, None).unwrap();
        *target.borrow_mut() = Some((project.clone(), node.clone()));
        engine.element(&project.get(&node).unwrap()).unwrap();

        let mut patch = NodePatch::default();
        patch.opacity = Some(Some(0.5));
        project.update(&node, patch).unwrap();

        // the write-back landed without re-entering the reactor
        assert_eq!(*updates.borrow(), 1);
        let after = project.get(&node).unwrap().props;
        assert_eq!(after.opacity, Some(0.5));
        assert_eq!(after.extra.get("synced"), Some(&Value::from(true)));

        // a later update finds the flag set and writes nothing back
        project.update(&node, NodePatch::default()).unwrap();
        assert_eq!(*updates.borrow(), 2);
    }

    #[test]
    fn element_access_is_cached_per_node() {
        let rig = rig();
        let node = rig.project.insert(logo_node(), None, None).unwrap();
        let snapshot = rig.project.get(&node).unwrap();
        let a = rig.engine.element(&snapshot).unwrap();
        let b = rig.engine.element(&snapshot).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
