//! Components and their lifecycle.
//!
//! A component is any value implementing [`Component`]: a required name, an
//! optional `setup` hook, declarative properties feeding the resource graph,
//! and per-phase event hooks with priorities. Components are flattened (a
//! component may reveal sub-components), given unique names, and driven
//! through the lifecycle by the engine.

use crate::builder::Builder;
use crate::config::{ConfigTree, ConfigurationError};
use crate::event::{Event, Priority};
use crate::population::SimulantData;
use crate::resource::ResourceId;
use crate::simulation::Simulation;
use anyhow::Result;
use serde_yaml::Value as YamlValue;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// A component's position in the engine's arena. Stable for the lifetime of
/// the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub usize);

/// Where the simulation currently is in its lifecycle. Registration is only
/// legal during `Setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecyclePhase {
    #[default]
    Bootstrap,
    Setup,
    PostSetup,
    PopulationCreation,
    TimeStepPrepare,
    TimeStep,
    TimeStepCleanup,
    CollectMetrics,
    SimulationEnd,
    Report,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Bootstrap => "bootstrap",
            LifecyclePhase::Setup => "setup",
            LifecyclePhase::PostSetup => "post_setup",
            LifecyclePhase::PopulationCreation => "population_creation",
            LifecyclePhase::TimeStepPrepare => "time_step__prepare",
            LifecyclePhase::TimeStep => "time_step",
            LifecyclePhase::TimeStepCleanup => "time_step__cleanup",
            LifecyclePhase::CollectMetrics => "collect_metrics",
            LifecyclePhase::SimulationEnd => "simulation_end",
            LifecyclePhase::Report => "report",
        };
        write!(f, "{name}")
    }
}

/// A user-supplied simulation plugin.
///
/// Only `name` is required. Declarative properties let the engine register
/// the component's simulant initializer and resource claims before `setup`
/// runs; views, streams, pipelines, and observations are requested inside
/// `setup` through the [`Builder`].
///
/// Event hooks are opted into by returning `Some(priority)` from the
/// matching `*_priority` method; the hook itself defaults to a no-op.
#[allow(unused_variables)]
pub trait Component {
    /// The component's unique name. By convention snake case, with
    /// distinguishing arguments appended after a dot.
    fn name(&self) -> String;

    /// A YAML fragment of configuration defaults, merged into the
    /// `component_configs` layer without overriding user values.
    fn configuration_defaults(&self) -> Option<String> {
        None
    }

    /// Nested components to add alongside this one. Drained once, at the
    /// time this component is added.
    fn sub_components(&mut self) -> Vec<Box<dyn Component>> {
        Vec::new()
    }

    /// Columns this component creates and initializes. Exactly one
    /// component may create any given column.
    fn columns_created(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extra resources the simulant initializer needs beyond the columns it
    /// creates (columns, values, or streams).
    fn initialization_requires(&self) -> Vec<ResourceId> {
        Vec::new()
    }

    /// Whether this component initializes simulants. Defaults to "creates
    /// columns".
    fn initializes_simulants(&self) -> bool {
        !self.columns_created().is_empty()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        Ok(())
    }

    fn post_setup_priority(&self) -> Option<Priority> {
        None
    }
    fn time_step_prepare_priority(&self) -> Option<Priority> {
        None
    }
    fn time_step_priority(&self) -> Option<Priority> {
        None
    }
    fn time_step_cleanup_priority(&self) -> Option<Priority> {
        None
    }
    fn collect_metrics_priority(&self) -> Option<Priority> {
        None
    }
    fn simulation_end_priority(&self) -> Option<Priority> {
        None
    }

    fn on_post_setup(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    /// Called once per population creation, in resource-dependency order,
    /// to fill in this component's columns for the new simulants.
    fn on_initialize_simulants(&mut self, data: &SimulantData, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn on_time_step_prepare(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn on_time_step_cleanup(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn on_collect_metrics(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn on_simulation_end(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    /// Receives events from custom channels this component registered for
    /// through the builder.
    fn on_event(&mut self, channel: &str, event: &Event, sim: &mut Simulation) -> Result<()> {
        Ok(())
    }
}

/// Tracks component identity and drives registration bookkeeping. The
/// component values themselves live in the engine's arena, beside the
/// managers, so hooks can borrow both at once.
#[derive(Debug, Default)]
pub struct ComponentManager {
    names: Vec<String>,
    by_name: HashMap<String, ComponentId>,
    pending: Vec<Box<dyn Component>>,
    frozen: bool,
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({})", self.name())
    }
}

impl ComponentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name_of(&self, id: ComponentId) -> &str {
        &self.names[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Claim a name and id for a component, and merge its configuration
    /// defaults. Called once per component, before its setup.
    pub(crate) fn register(
        &mut self,
        component: &dyn Component,
        config: &mut ConfigTree,
    ) -> Result<ComponentId, ConfigurationError> {
        if self.frozen {
            return Err(ConfigurationError::RegistrationClosed {
                what: format!("component '{}'", component.name()),
                phase: "post-setup".to_string(),
            });
        }
        let name = component.name();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyComponentName(self.names.len()));
        }
        if self.by_name.contains_key(&name) {
            return Err(ConfigurationError::DuplicateComponentName(name));
        }
        if let Some(defaults) = component.configuration_defaults() {
            merge_component_defaults(config, &name, &defaults)?;
        }
        let id = ComponentId(self.names.len());
        debug!(component = name, id = id.0, "registered component");
        self.by_name.insert(name.clone(), id);
        self.names.push(name);
        Ok(id)
    }

    /// Queue a component discovered during setup; the engine adds and sets
    /// it up after the current component finishes.
    pub fn queue_component(
        &mut self,
        component: Box<dyn Component>,
    ) -> Result<(), ConfigurationError> {
        if self.frozen {
            return Err(ConfigurationError::RegistrationClosed {
                what: format!("component '{}'", component.name()),
                phase: "post-setup".to_string(),
            });
        }
        self.pending.push(component);
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Box<dyn Component>> {
        std::mem::take(&mut self.pending)
    }
}

/// Merge one component's defaults into the `component_configs` layer. A
/// leaf already claimed by a different component is a configuration error;
/// user overrides in outer layers are untouched by construction.
fn merge_component_defaults(
    config: &mut ConfigTree,
    component: &str,
    defaults: &str,
) -> Result<(), ConfigurationError> {
    let parsed: YamlValue =
        serde_yaml::from_str(defaults).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
    let mut paths = Vec::new();
    collect_leaf_paths(&parsed, String::new(), &mut paths);
    for path in &paths {
        if let Some((_, source)) = config.layer_entry(path, "component_configs")? {
            if source != component {
                return Err(ConfigurationError::DuplicatedDefault {
                    key: path.clone(),
                    first: source.to_string(),
                    second: component.to_string(),
                });
            }
        }
    }
    config.update_yaml_str(defaults, "component_configs", component)
}

fn collect_leaf_paths(value: &YamlValue, prefix: String, out: &mut Vec<String>) {
    match value {
        YamlValue::Mapping(mapping) => {
            for (key, child) in mapping {
                if let YamlValue::String(key) = key {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    collect_leaf_paths(child, path, out);
                }
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix);
            }
        }
    }
}
