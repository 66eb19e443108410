use crate::descriptor::{
    ApplicationDescriptor, ApplicationUpdate, ComponentInstance, ComponentSpec,
    HostFacts, HostedComponentDescriptor, LoadSample, NodeDeployment, NodeDeploymentUpdate,
    NodeDynamicInfo, NodeState, ProcessDescriptor, ProcessDynamicInfo, ProcessInstance,
    ProcessSpec, ProcessState, PropertySet, TemplateDescriptor,
};
use crate::entity::{EntityKind, EntityPath, Topology};
use crate::error::TopologyError;
use crate::events::{InboundEvent, TreeDelta};
use crate::reconciler::Reconciler;
use indexmap::IndexMap;

fn vars(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn refs(names: &[&str]) -> PropertySet {
    PropertySet {
        properties: Vec::new(),
        references: names.iter().map(|n| n.to_string()).collect(),
    }
}

fn from_template(template: &str, params: &[(&str, &str)]) -> ProcessSpec {
    ProcessSpec::FromTemplate(ProcessInstance {
        template: template.into(),
        parameter_values: vars(params),
        property_set: PropertySet::default(),
    })
}

fn path(segments: &[&str]) -> EntityPath {
    EntityPath(segments.iter().map(|s| s.to_string()).collect())
}

/// An application deploying two instances of template `T` onto node `n1`.
/// `mode` comes from the application scope, `flavor` from template defaults,
/// so the two can be changed independently in update tests.
fn fixture_app(name: &str) -> ApplicationDescriptor {
    let mut app = ApplicationDescriptor {
        name: name.into(),
        variables: vars(&[("mode", "fast")]),
        ..Default::default()
    };
    app.process_templates.insert(
        "T".into(),
        TemplateDescriptor {
            descriptor: ProcessDescriptor {
                id: "s${i}".into(),
                exe: "run --mode ${mode} --flavor ${flavor}".into(),
                ..Default::default()
            },
            parameter_defaults: vars(&[("i", "0"), ("flavor", "plain")]),
        },
    );
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            // Deliberately out of id order; the tree must sort them.
            processes: vec![from_template("T", &[("i", "2")]), from_template("T", &[("i", "1")])],
            ..Default::default()
        },
    );
    app
}

fn node_info(name: &str) -> NodeDynamicInfo {
    NodeDynamicInfo {
        name: name.into(),
        facts: HostFacts {
            hostname: format!("{name}-host"),
            os: "Linux".into(),
            machine: "x86_64".into(),
            n_cores: 8,
        },
        processes: Vec::new(),
        endpoint_groups: Vec::new(),
    }
}

fn descriptor_of(topology: &Topology, node: &str, id: &str) -> ProcessDescriptor {
    let node_key = topology.find_node(node).unwrap();
    let process_key = topology.find_process(node_key, id).unwrap();
    topology
        .get(process_key)
        .unwrap()
        .as_process()
        .unwrap()
        .descriptor
        .clone()
}

fn process_ids(topology: &Topology, node: &str) -> Vec<String> {
    let node_key = topology.find_node(node).unwrap();
    topology
        .children(node_key)
        .iter()
        .map(|key| topology.get(*key).unwrap().id.clone())
        .collect()
}

// --- registration ----------------------------------------------------------

#[test]
fn application_added_builds_sorted_processes() {
    let mut rec = Reconciler::new();
    let deltas = rec
        .apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    assert_eq!(
        deltas,
        vec![
            TreeDelta::EntitiesInserted {
                parent: EntityPath::root(),
                indices: vec![0],
            },
            TreeDelta::EntitiesInserted {
                parent: path(&["n1"]),
                indices: vec![0, 1],
            },
        ]
    );
    assert_eq!(process_ids(rec.topology(), "n1"), vec!["s1", "s2"]);
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "s1").exe,
        "run --mode fast --flavor plain"
    );
}

#[test]
fn registering_the_same_application_twice_is_a_protocol_violation() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let err = rec
        .apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, TopologyError::ApplicationExists(_)));
}

#[test]
fn application_removed_prunes_a_node_that_never_came_up() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationRemoved("demo".into()))
        .unwrap();
    assert!(rec.topology().application("demo").is_none());
    assert!(rec.topology().nodes().is_empty());
    // Processes leave first, then the childless Unknown node itself.
    assert!(matches!(
        deltas.last(),
        Some(TreeDelta::EntitiesRemoved { parent, removed, .. })
            if *parent == EntityPath::root() && removed[0].kind == EntityKind::Node
    ));
}

#[test]
fn updating_an_unknown_application_is_a_protocol_violation() {
    let mut rec = Reconciler::new();
    let err = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "ghost".into(),
            ..Default::default()
        }))
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, TopologyError::ApplicationNotFound(_)));
}

// --- updates and cascade ----------------------------------------------------

#[test]
fn variable_change_cascades_to_every_dependent_process() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            variables: vars(&[("mode", "turbo")]),
            ..Default::default()
        }))
        .unwrap();

    // The diff names no process explicitly, yet both depend on `mode`.
    assert_eq!(
        deltas,
        vec![
            TreeDelta::StructureChanged { path: path(&["n1", "s1"]) },
            TreeDelta::StructureChanged { path: path(&["n1", "s2"]) },
        ]
    );
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "s1").exe,
        "run --mode turbo --flavor plain"
    );
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "s2").exe,
        "run --mode turbo --flavor plain"
    );
}

#[test]
fn explicit_instance_update_leaves_siblings_untouched() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            nodes: [(
                "n1".to_string(),
                NodeDeploymentUpdate {
                    processes: vec![from_template("T", &[("i", "1"), ("flavor", "spicy")])],
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .unwrap();

    assert_eq!(
        deltas,
        vec![TreeDelta::StructureChanged { path: path(&["n1", "s1"]) }]
    );
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "s1").exe,
        "run --mode fast --flavor spicy"
    );
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "s2").exe,
        "run --mode fast --flavor plain"
    );

    // The entity now re-expands from the diff's spec, not the original one.
    let topology = rec.topology();
    let node_key = topology.find_node("n1").unwrap();
    let process_key = topology.find_process(node_key, "s1").unwrap();
    let body = topology.get(process_key).unwrap().as_process().unwrap();
    assert_eq!(
        body.source,
        Some(from_template("T", &[("i", "1"), ("flavor", "spicy")]))
    );
}

#[test]
fn update_removes_a_process_by_concrete_id() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            nodes: [(
                "n1".to_string(),
                NodeDeploymentUpdate {
                    remove_processes: vec!["s1".into()],
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .unwrap();

    // Removal indices address the child list before the removal.
    assert!(matches!(
        &deltas[..],
        [TreeDelta::EntitiesRemoved { parent, indices, removed }]
            if *parent == path(&["n1"]) && *indices == vec![0] && removed[0].id == "s1"
    ));
    assert_eq!(process_ids(rec.topology(), "n1"), vec!["s2"]);
    // The spec leaves the stored scope too, not just the tree.
    let app = rec.topology().application("demo").unwrap();
    assert_eq!(app.nodes["n1"].processes.len(), 1);
}

#[test]
fn removing_an_unknown_process_is_a_protocol_violation() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let err = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            nodes: [(
                "n1".to_string(),
                NodeDeploymentUpdate {
                    remove_processes: vec!["s9".into()],
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, TopologyError::ProcessNotFound { .. }));
}

#[test]
fn variable_driven_id_change_keeps_a_single_sibling() {
    let mut app = ApplicationDescriptor {
        name: "demo".into(),
        variables: vars(&[("v", "1")]),
        ..Default::default()
    };
    let spec = ProcessSpec::Direct(ProcessDescriptor {
        id: "s${v}".into(),
        exe: "serve".into(),
        ..Default::default()
    });
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            processes: vec![spec.clone()],
            ..Default::default()
        },
    );

    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(app)).unwrap();
    let node_key = rec.topology().find_node("n1").unwrap();
    let original = rec.topology().find_process(node_key, "s1").unwrap();

    // The diff both moves the id (v: 1 -> 2) and re-lists the spec; the
    // upsert must find the moved entity instead of inserting a twin.
    rec.apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
        name: "demo".into(),
        variables: vars(&[("v", "2")]),
        nodes: [(
            "n1".to_string(),
            NodeDeploymentUpdate {
                processes: vec![spec],
                ..Default::default()
            },
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    }))
    .unwrap();

    assert_eq!(process_ids(rec.topology(), "n1"), vec!["s2"]);
    // Same entity under its new id.
    assert_eq!(rec.topology().find_process(node_key, "s2"), Some(original));
}

#[test]
fn component_template_change_rebuilds_a_direct_host_process() {
    let mut app = ApplicationDescriptor {
        name: "demo".into(),
        ..Default::default()
    };
    app.component_templates.insert(
        "C".into(),
        TemplateDescriptor {
            descriptor: HostedComponentDescriptor {
                name: "c".into(),
                entry: "lib:v1".into(),
                ..Default::default()
            },
            parameter_defaults: IndexMap::new(),
        },
    );
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            processes: vec![ProcessSpec::Direct(ProcessDescriptor {
                id: "host".into(),
                exe: "serve".into(),
                components: vec![ComponentSpec::FromTemplate(ComponentInstance {
                    template: "C".into(),
                    parameter_values: IndexMap::new(),
                    property_set: PropertySet::default(),
                })],
                ..Default::default()
            })],
            ..Default::default()
        },
    );

    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(app)).unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            component_templates: [(
                "C".to_string(),
                TemplateDescriptor {
                    descriptor: HostedComponentDescriptor {
                        name: "c".into(),
                        entry: "lib:v2".into(),
                        ..Default::default()
                    },
                    parameter_defaults: IndexMap::new(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .unwrap();

    // The host process descriptor is untouched, but its expanded component
    // follows the new template body.
    assert_eq!(
        deltas,
        vec![TreeDelta::StructureChanged { path: path(&["n1", "host"]) }]
    );
    let topology = rec.topology();
    let node_key = topology.find_node("n1").unwrap();
    let host = topology.find_process(node_key, "host").unwrap();
    let body = topology.get(host).unwrap().as_process().unwrap();
    let component = topology
        .get(body.components[0])
        .unwrap()
        .as_component()
        .unwrap();
    assert_eq!(component.descriptor.entry, "lib:v2");
}

#[test]
fn update_deploys_onto_a_new_node() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ApplicationUpdated(ApplicationUpdate {
            name: "demo".into(),
            nodes: [(
                "n2".to_string(),
                NodeDeploymentUpdate {
                    processes: vec![from_template("T", &[("i", "5")])],
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .unwrap();

    assert_eq!(
        deltas,
        vec![
            TreeDelta::EntitiesInserted {
                parent: EntityPath::root(),
                indices: vec![1],
            },
            TreeDelta::EntitiesInserted {
                parent: path(&["n2"]),
                indices: vec![0],
            },
        ]
    );
    assert_eq!(process_ids(rec.topology(), "n2"), vec!["s5"]);
}

#[test]
fn applying_a_diff_converges_with_registering_the_merged_descriptor() {
    let base = fixture_app("demo");
    let update = ApplicationUpdate {
        name: "demo".into(),
        variables: vars(&[("mode", "turbo")]),
        nodes: [(
            "n1".to_string(),
            NodeDeploymentUpdate {
                processes: vec![from_template("T", &[("i", "3")])],
                ..Default::default()
            },
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let mut merged = base.clone();
    merged.variables.insert("mode".into(), "turbo".into());
    merged
        .nodes
        .get_mut("n1")
        .unwrap()
        .processes
        .push(from_template("T", &[("i", "3")]));

    let mut incremental = Reconciler::new();
    incremental
        .apply(InboundEvent::ApplicationAdded(base))
        .unwrap();
    incremental
        .apply(InboundEvent::ApplicationUpdated(update))
        .unwrap();

    let mut direct = Reconciler::new();
    direct
        .apply(InboundEvent::ApplicationAdded(merged))
        .unwrap();

    assert_eq!(
        incremental.topology().application("demo"),
        direct.topology().application("demo")
    );
    assert_eq!(
        process_ids(incremental.topology(), "n1"),
        process_ids(direct.topology(), "n1")
    );
    for id in ["s1", "s2", "s3"] {
        assert_eq!(
            descriptor_of(incremental.topology(), "n1", id),
            descriptor_of(direct.topology(), "n1", id),
        );
    }
}

// --- node lifecycle ---------------------------------------------------------

#[test]
fn node_up_overlays_status_and_adopts_unknown_processes() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let mut info = node_info("n1");
    info.processes = vec![
        ProcessDynamicInfo {
            id: "s1".into(),
            state: ProcessState::Active,
            pid: Some(42),
            enabled: true,
        },
        ProcessDynamicInfo {
            id: "ghost".into(),
            state: ProcessState::Activating,
            pid: None,
            enabled: true,
        },
    ];
    let deltas = rec.apply(InboundEvent::NodeUp(info)).unwrap();

    let topology = rec.topology();
    let node_key = topology.find_node("n1").unwrap();
    assert_eq!(topology.node_state(node_key), Some(NodeState::Up));

    let s1 = topology.find_process(node_key, "s1").unwrap();
    let body = topology.get(s1).unwrap().as_process().unwrap();
    assert_eq!(body.state, ProcessState::Active);
    assert_eq!(body.pid, Some(42));

    // `ghost` has no static deployment behind it.
    let ghost = topology.find_process(node_key, "ghost").unwrap();
    let body = topology.get(ghost).unwrap().as_process().unwrap();
    assert!(body.application.is_none());

    assert!(deltas.contains(&TreeDelta::EntityChanged { path: path(&["n1"]) }));
    assert!(deltas.contains(&TreeDelta::EntityChanged { path: path(&["n1", "s1"]) }));
    // `ghost` sorts before `s1` and `s2`.
    assert!(deltas.contains(&TreeDelta::EntitiesInserted {
        parent: path(&["n1"]),
        indices: vec![0],
    }));
}

#[test]
fn node_down_drops_dynamic_processes_and_clears_status() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();
    let mut info = node_info("n1");
    info.processes = vec![
        ProcessDynamicInfo {
            id: "s1".into(),
            state: ProcessState::Active,
            pid: Some(42),
            enabled: true,
        },
        ProcessDynamicInfo {
            id: "ghost".into(),
            state: ProcessState::Active,
            pid: Some(43),
            enabled: true,
        },
    ];
    rec.apply(InboundEvent::NodeUp(info)).unwrap();

    let deltas = rec.apply(InboundEvent::NodeDown("n1".into())).unwrap();

    let topology = rec.topology();
    let node_key = topology.find_node("n1").unwrap();
    assert_eq!(topology.node_state(node_key), Some(NodeState::Down));
    assert!(topology.find_process(node_key, "ghost").is_none());

    let s1 = topology.find_process(node_key, "s1").unwrap();
    let body = topology.get(s1).unwrap().as_process().unwrap();
    assert_eq!(body.state, ProcessState::Unknown);
    assert_eq!(body.pid, None);

    assert!(matches!(
        &deltas[0],
        TreeDelta::EntitiesRemoved { indices, removed, .. }
            if *indices == vec![0] && removed[0].id == "ghost"
    ));
}

#[test]
fn node_down_prunes_a_node_with_no_deployments() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::NodeUp(node_info("n2"))).unwrap();
    assert!(rec.topology().find_node("n2").is_some());

    let deltas = rec.apply(InboundEvent::NodeDown("n2".into())).unwrap();
    assert!(rec.topology().find_node("n2").is_none());
    assert!(matches!(
        deltas.last(),
        Some(TreeDelta::EntitiesRemoved { parent, removed, .. })
            if *parent == EntityPath::root() && removed[0].kind == EntityKind::Node
    ));
}

#[test]
fn node_down_for_an_unknown_node_is_a_no_op() {
    let mut rec = Reconciler::new();
    let deltas = rec.apply(InboundEvent::NodeDown("n9".into())).unwrap();
    assert!(deltas.is_empty());
}

#[test]
fn host_facts_resolve_after_the_node_comes_up() {
    let mut app = ApplicationDescriptor {
        name: "facts".into(),
        ..Default::default()
    };
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            processes: vec![ProcessSpec::Direct(ProcessDescriptor {
                id: "reporter".into(),
                exe: "report ${node.hostname}".into(),
                ..Default::default()
            })],
            ..Default::default()
        },
    );

    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(app)).unwrap();
    // Facts are not known yet; the placeholder stays literal.
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "reporter").exe,
        "report ${node.hostname}"
    );

    let deltas = rec.apply(InboundEvent::NodeUp(node_info("n1"))).unwrap();
    assert_eq!(
        descriptor_of(rec.topology(), "n1", "reporter").exe,
        "report n1-host"
    );
    assert!(deltas.contains(&TreeDelta::StructureChanged {
        path: path(&["n1", "reporter"]),
    }));
}

// --- status and load --------------------------------------------------------

#[test]
fn status_for_an_unknown_process_is_logged_and_dropped() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();

    let deltas = rec
        .apply(InboundEvent::ProcessStatusChanged {
            node: "n1".into(),
            info: ProcessDynamicInfo {
                id: "s9".into(),
                state: ProcessState::Active,
                pid: Some(1),
                enabled: true,
            },
        })
        .unwrap();
    assert!(deltas.is_empty());

    let deltas = rec
        .apply(InboundEvent::ProcessStatusChanged {
            node: "n9".into(),
            info: ProcessDynamicInfo {
                id: "s1".into(),
                state: ProcessState::Active,
                pid: Some(1),
                enabled: true,
            },
        })
        .unwrap();
    assert!(deltas.is_empty());
}

#[test]
fn repeated_status_reports_emit_no_delta() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(fixture_app("demo")))
        .unwrap();
    rec.apply(InboundEvent::NodeUp(node_info("n1"))).unwrap();

    let info = ProcessDynamicInfo {
        id: "s1".into(),
        state: ProcessState::Active,
        pid: Some(7),
        enabled: true,
    };
    let first = rec
        .apply(InboundEvent::ProcessStatusChanged {
            node: "n1".into(),
            info: info.clone(),
        })
        .unwrap();
    assert_eq!(
        first,
        vec![TreeDelta::EntityChanged { path: path(&["n1", "s1"]) }]
    );

    let second = rec
        .apply(InboundEvent::ProcessStatusChanged {
            node: "n1".into(),
            info,
        })
        .unwrap();
    assert!(second.is_empty());
}

#[test]
fn stale_load_sample_is_discarded_by_identity() {
    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::NodeUp(node_info("n1"))).unwrap();
    let node_key = rec.topology().find_node("n1").unwrap();
    let load = LoadSample {
        avg1: 1.0,
        avg5: 0.5,
        avg15: 0.25,
    };

    let deltas = rec
        .apply(InboundEvent::NodeLoadSampled {
            target: node_key,
            load,
        })
        .unwrap();
    assert_eq!(deltas, vec![TreeDelta::EntityChanged { path: path(&["n1"]) }]);
    assert_eq!(rec.topology().load_average(node_key), Some(load));

    // Same sample again: nothing changed, nothing emitted.
    let deltas = rec
        .apply(InboundEvent::NodeLoadSampled {
            target: node_key,
            load,
        })
        .unwrap();
    assert!(deltas.is_empty());

    // The node leaves the tree; a completion issued against the old key
    // must not resurrect or corrupt anything.
    rec.apply(InboundEvent::NodeDown("n1".into())).unwrap();
    let deltas = rec
        .apply(InboundEvent::NodeLoadSampled {
            target: node_key,
            load,
        })
        .unwrap();
    assert!(deltas.is_empty());
}

// --- configuration errors ----------------------------------------------------

#[test]
fn property_set_cycle_is_recorded_on_the_entity() {
    let mut app = ApplicationDescriptor {
        name: "loopy".into(),
        ..Default::default()
    };
    app.property_sets.insert("A".into(), refs(&["B"]));
    app.property_sets.insert("B".into(), refs(&["A"]));
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            processes: vec![ProcessSpec::Direct(ProcessDescriptor {
                id: "p".into(),
                property_set: refs(&["A"]),
                ..Default::default()
            })],
            ..Default::default()
        },
    );

    let mut rec = Reconciler::new();
    rec.apply(InboundEvent::ApplicationAdded(app)).unwrap();

    let topology = rec.topology();
    let node_key = topology.find_node("n1").unwrap();
    let process_key = topology.find_process(node_key, "p").unwrap();
    let error = topology.get(process_key).unwrap().expansion_error.clone();
    assert!(error.is_some_and(|msg| msg.contains("cycle")));
}

#[test]
fn missing_named_property_set_fails_registration() {
    let mut app = ApplicationDescriptor {
        name: "broken".into(),
        ..Default::default()
    };
    app.nodes.insert(
        "n1".into(),
        NodeDeployment {
            processes: vec![ProcessSpec::Direct(ProcessDescriptor {
                id: "p".into(),
                property_set: refs(&["absent"]),
                ..Default::default()
            })],
            ..Default::default()
        },
    );

    let mut rec = Reconciler::new();
    let err = rec.apply(InboundEvent::ApplicationAdded(app)).unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, TopologyError::PropertySetNotFound(_)));
}
