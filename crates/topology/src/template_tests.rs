use crate::descriptor::{
    ApplicationDescriptor, ComponentInstance, HostedComponentDescriptor, ProcessDescriptor,
    ProcessInstance, ProcessSpec, TemplateDescriptor,
};
use crate::error::TopologyError;
use crate::resolver::Resolver;
use crate::template::{
    build_process, concrete_id, concrete_process, expand_component, expand_process,
};
use indexmap::IndexMap;
use std::sync::Arc;

fn vars(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn app_scope(app: &ApplicationDescriptor) -> Resolver {
    Resolver::with_scopes(vec![Arc::new(app.variables.clone())])
}

/// An application with one process template `T` (`id = srv-${index}`,
/// default `index = 0`) and one component template `C`.
fn fixture_app() -> ApplicationDescriptor {
    let mut app = ApplicationDescriptor {
        name: "demo".into(),
        variables: vars(&[("region", "eu"), ("index", "9")]),
        ..Default::default()
    };
    app.process_templates.insert(
        "T".into(),
        TemplateDescriptor {
            descriptor: ProcessDescriptor {
                id: "srv-${index}".into(),
                exe: "serve --id ${process} --region ${region}".into(),
                ..Default::default()
            },
            parameter_defaults: vars(&[("index", "0")]),
        },
    );
    app.component_templates.insert(
        "C".into(),
        TemplateDescriptor {
            descriptor: HostedComponentDescriptor {
                name: "comp-${slot}".into(),
                entry: "lib:create ${component}".into(),
                ..Default::default()
            },
            parameter_defaults: vars(&[("slot", "a")]),
        },
    );
    app
}

fn instance(template: &str, params: &[(&str, &str)]) -> ProcessInstance {
    ProcessInstance {
        template: template.into(),
        parameter_values: vars(params),
        property_set: Default::default(),
    }
}

#[test]
fn expansion_is_deterministic() {
    let app = fixture_app();
    let caller = app_scope(&app);
    let instance = instance("T", &[("index", "3")]);

    let (first, r1) = expand_process(&app, &caller, &instance).unwrap();
    let (second, r2) = expand_process(&app, &caller, &instance).unwrap();
    assert_eq!(first, second);
    assert_eq!(r1, r2);
}

#[test]
fn process_self_key_binds_to_the_concrete_id() {
    let app = fixture_app();
    let caller = app_scope(&app);

    let (descriptor, resolver) =
        expand_process(&app, &caller, &instance("T", &[("index", "3")])).unwrap();
    assert_eq!(descriptor.id, "srv-3");
    assert_eq!(descriptor.exe, "serve --id srv-3 --region eu");
    assert_eq!(resolver.find("process"), Some("srv-3"));
}

#[test]
fn instance_parameters_shadow_template_defaults() {
    let app = fixture_app();
    let caller = app_scope(&app);

    let (explicit, _) = expand_process(&app, &caller, &instance("T", &[("index", "7")])).unwrap();
    assert_eq!(explicit.id, "srv-7");

    // Without an explicit value the template default wins, even though the
    // application scope also binds `index`.
    let (defaulted, _) = expand_process(&app, &caller, &instance("T", &[])).unwrap();
    assert_eq!(defaulted.id, "srv-0");
}

#[test]
fn missing_template_is_a_protocol_violation() {
    let app = fixture_app();
    let caller = app_scope(&app);

    let err = expand_process(&app, &caller, &instance("absent", &[])).unwrap_err();
    assert!(err.is_protocol_violation());
    match err {
        TopologyError::TemplateNotFound {
            template,
            application,
        } => {
            assert_eq!(template, "absent");
            assert_eq!(application, "demo");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn direct_descriptor_substitutes_against_the_caller_scope() {
    let app = fixture_app();
    let caller = app_scope(&app);
    let descriptor = ProcessDescriptor {
        id: "gateway-${region}".into(),
        exe: "${process}.bin".into(),
        ..Default::default()
    };

    let (concrete, resolver) = concrete_process(&descriptor, &caller);
    assert_eq!(concrete.id, "gateway-eu");
    assert_eq!(concrete.exe, "gateway-eu.bin");
    assert_eq!(resolver.find("process"), Some("gateway-eu"));
}

#[test]
fn concrete_id_agrees_with_build_process() {
    let app = fixture_app();
    let caller = app_scope(&app);
    let specs = [
        ProcessSpec::Direct(ProcessDescriptor {
            id: "gateway-${region}".into(),
            ..Default::default()
        }),
        ProcessSpec::FromTemplate(instance("T", &[("index", "4")])),
        ProcessSpec::FromTemplate(instance("T", &[])),
    ];

    for spec in &specs {
        let (descriptor, _) = build_process(&app, &caller, spec).unwrap();
        assert_eq!(concrete_id(&app, &caller, spec).unwrap(), descriptor.id);
    }
}

#[test]
fn component_self_key_binds_to_the_concrete_name() {
    let app = fixture_app();
    let caller = app_scope(&app);
    let instance = ComponentInstance {
        template: "C".into(),
        parameter_values: vars(&[("slot", "b")]),
        property_set: Default::default(),
    };

    let (descriptor, resolver) = expand_component(&app, &caller, &instance).unwrap();
    assert_eq!(descriptor.name, "comp-b");
    assert_eq!(descriptor.entry, "lib:create comp-b");
    assert_eq!(resolver.find("component"), Some("comp-b"));
}

#[test]
fn unresolved_placeholders_survive_expansion_literally() {
    let app = fixture_app();
    let caller = app_scope(&app);
    let descriptor = ProcessDescriptor {
        id: "fixed".into(),
        exe: "serve --port ${port}".into(),
        ..Default::default()
    };

    let (concrete, _) = concrete_process(&descriptor, &caller);
    assert_eq!(concrete.exe, "serve --port ${port}");
}
