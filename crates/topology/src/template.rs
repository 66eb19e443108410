//! Template expansion
//!
//! Turns a template id plus parameter bindings into a concrete descriptor
//! and the resolver it was expanded with. Expansion is a pure function of
//! its inputs: re-running it with identical inputs yields field-for-field
//! equal output, which is what makes re-expansion after an upstream variable
//! change idempotent.

use crate::descriptor::{
    ApplicationDescriptor, ComponentInstance, ComponentSpec, EndpointGroupDescriptor,
    HostedComponentDescriptor, ProcessDescriptor, ProcessInstance, ProcessSpec, PropertyDescriptor,
    PropertySet,
};
use crate::error::{Result, TopologyError};
use crate::resolver::Resolver;
use indexmap::IndexMap;
use std::sync::Arc;

/// Reserved key bound to a process's own resolved id, so descriptor fields
/// can reference it as `${process}`.
pub const PROCESS_SELF_KEY: &str = "process";

/// Reserved key bound to a hosted component's own resolved name.
pub const COMPONENT_SELF_KEY: &str = "component";

/// Expand a process template instantiation against its application scope.
///
/// The new resolver chain is `[instance parameters, template defaults]`
/// layered over the caller's scopes, so explicit instance values shadow
/// defaults, and defaults shadow enclosing-scope variables.
pub fn expand_process(
    app: &ApplicationDescriptor,
    caller: &Resolver,
    instance: &ProcessInstance,
) -> Result<(ProcessDescriptor, Resolver)> {
    let template = app.process_templates.get(&instance.template).ok_or_else(|| {
        TopologyError::TemplateNotFound {
            template: instance.template.clone(),
            application: app.name.clone(),
        }
    })?;
    let mut resolver = caller.derive(vec![
        Arc::new(instance.parameter_values.clone()),
        Arc::new(template.parameter_defaults.clone()),
    ]);
    let id = resolver.substitute(&template.descriptor.id);
    resolver.set_computed(PROCESS_SELF_KEY, &id);
    let descriptor = substitute_process(&template.descriptor, &resolver);
    Ok((descriptor, resolver))
}

/// Expand a hosted-component template instantiation.
pub fn expand_component(
    app: &ApplicationDescriptor,
    caller: &Resolver,
    instance: &ComponentInstance,
) -> Result<(HostedComponentDescriptor, Resolver)> {
    let template = app
        .component_templates
        .get(&instance.template)
        .ok_or_else(|| TopologyError::TemplateNotFound {
            template: instance.template.clone(),
            application: app.name.clone(),
        })?;
    let mut resolver = caller.derive(vec![
        Arc::new(instance.parameter_values.clone()),
        Arc::new(template.parameter_defaults.clone()),
    ]);
    let name = resolver.substitute(&template.descriptor.name);
    resolver.set_computed(COMPONENT_SELF_KEY, &name);
    let descriptor = substitute_component(&template.descriptor, &resolver);
    Ok((descriptor, resolver))
}

/// Make a directly-declared process descriptor concrete.
pub fn concrete_process(
    descriptor: &ProcessDescriptor,
    caller: &Resolver,
) -> (ProcessDescriptor, Resolver) {
    let mut resolver = caller.derive(Vec::new());
    let id = resolver.substitute(&descriptor.id);
    resolver.set_computed(PROCESS_SELF_KEY, &id);
    (substitute_process(descriptor, &resolver), resolver)
}

/// Make a directly-declared hosted-component descriptor concrete.
pub fn concrete_component(
    descriptor: &HostedComponentDescriptor,
    caller: &Resolver,
) -> (HostedComponentDescriptor, Resolver) {
    let mut resolver = caller.derive(Vec::new());
    let name = resolver.substitute(&descriptor.name);
    resolver.set_computed(COMPONENT_SELF_KEY, &name);
    (substitute_component(descriptor, &resolver), resolver)
}

/// Build a process spec, templated or not, against an application scope.
pub fn build_process(
    app: &ApplicationDescriptor,
    caller: &Resolver,
    spec: &ProcessSpec,
) -> Result<(ProcessDescriptor, Resolver)> {
    match spec {
        ProcessSpec::Direct(descriptor) => Ok(concrete_process(descriptor, caller)),
        ProcessSpec::FromTemplate(instance) => expand_process(app, caller, instance),
    }
}

/// Build a component spec, templated or not, against an application scope.
pub fn build_component(
    app: &ApplicationDescriptor,
    caller: &Resolver,
    spec: &ComponentSpec,
) -> Result<(HostedComponentDescriptor, Resolver)> {
    match spec {
        ComponentSpec::Direct(descriptor) => Ok(concrete_component(descriptor, caller)),
        ComponentSpec::FromTemplate(instance) => expand_component(app, caller, instance),
    }
}

/// Concrete id a process spec would expand to, without building the rest of
/// the descriptor. Matches [`build_process`] exactly; used to pair update
/// diffs with the specs they replace.
pub fn concrete_id(
    app: &ApplicationDescriptor,
    caller: &Resolver,
    spec: &ProcessSpec,
) -> Result<String> {
    match spec {
        ProcessSpec::Direct(descriptor) => {
            let resolver = caller.derive(Vec::new());
            Ok(resolver.substitute(&descriptor.id))
        }
        ProcessSpec::FromTemplate(instance) => {
            let template = app.process_templates.get(&instance.template).ok_or_else(|| {
                TopologyError::TemplateNotFound {
                    template: instance.template.clone(),
                    application: app.name.clone(),
                }
            })?;
            let resolver = caller.derive(vec![
                Arc::new(instance.parameter_values.clone()),
                Arc::new(template.parameter_defaults.clone()),
            ]);
            Ok(resolver.substitute(&template.descriptor.id))
        }
    }
}

fn substitute_process(descriptor: &ProcessDescriptor, resolver: &Resolver) -> ProcessDescriptor {
    ProcessDescriptor {
        id: resolver.substitute(&descriptor.id),
        exe: resolver.substitute(&descriptor.exe),
        property_set: substitute_property_set(&descriptor.property_set, resolver),
        endpoint_groups: descriptor
            .endpoint_groups
            .iter()
            .map(|group| substitute_endpoint_group(group, resolver))
            .collect(),
        components: descriptor
            .components
            .iter()
            .map(|spec| substitute_component_spec(spec, resolver))
            .collect(),
    }
}

fn substitute_component(
    descriptor: &HostedComponentDescriptor,
    resolver: &Resolver,
) -> HostedComponentDescriptor {
    HostedComponentDescriptor {
        name: resolver.substitute(&descriptor.name),
        entry: resolver.substitute(&descriptor.entry),
        property_set: substitute_property_set(&descriptor.property_set, resolver),
        endpoint_groups: descriptor
            .endpoint_groups
            .iter()
            .map(|group| substitute_endpoint_group(group, resolver))
            .collect(),
    }
}

fn substitute_endpoint_group(
    group: &EndpointGroupDescriptor,
    resolver: &Resolver,
) -> EndpointGroupDescriptor {
    EndpointGroupDescriptor {
        name: resolver.substitute(&group.name),
        endpoints: resolver.substitute(&group.endpoints),
        replica_group: group
            .replica_group
            .as_deref()
            .map(|rg| resolver.substitute(rg)),
    }
}

fn substitute_property_set(set: &PropertySet, resolver: &Resolver) -> PropertySet {
    PropertySet {
        properties: set
            .properties
            .iter()
            .map(|p| PropertyDescriptor::new(resolver.substitute(&p.name), resolver.substitute(&p.value)))
            .collect(),
        references: set
            .references
            .iter()
            .map(|r| resolver.substitute(r))
            .collect(),
    }
}

fn substitute_component_spec(spec: &ComponentSpec, resolver: &Resolver) -> ComponentSpec {
    match spec {
        // Direct descriptors are substituted again with their own resolver
        // when the component entity is built; substituting here keys their
        // fields to the enclosing process scope as well.
        ComponentSpec::Direct(descriptor) => {
            ComponentSpec::Direct(substitute_component(descriptor, resolver))
        }
        ComponentSpec::FromTemplate(instance) => ComponentSpec::FromTemplate(ComponentInstance {
            template: resolver.substitute(&instance.template),
            parameter_values: instance
                .parameter_values
                .iter()
                .map(|(k, v)| (k.clone(), resolver.substitute(v)))
                .collect::<IndexMap<_, _>>(),
            property_set: substitute_property_set(&instance.property_set, resolver),
        }),
    }
}
