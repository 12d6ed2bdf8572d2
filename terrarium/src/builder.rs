//! The setup-time interface handed to each component.
//!
//! The builder scopes every registration to the component being set up and
//! exposes each manager through a small interface value, so components
//! never hold the managers themselves. All registration is only legal
//! during the setup phase.

use crate::clock::SimulationClock;
use crate::component::{Component, ComponentId, LifecyclePhase};
use crate::config::{ConfigTree, ConfigurationError};
use crate::event::{Emitter, HookKind, ListenerTarget, Priority};
use crate::population::{PopulationView, Query};
use crate::randomness::RandomnessStream;
use crate::results::observation::{Observation, ObservationKind};
use crate::results::{
    AddingObservation, ConcatenatingObservation, MapperFn, ObservationResults, RowTable,
    Stratification, StratificationInput, UnstratifiedObservation,
};
use crate::simulation::Simulation;
use crate::values::{ModifierFn, PostProcessor, SourceFn, ValueHandle};

/// Access to engine registration, scoped to one component's setup.
pub struct Builder<'a> {
    pub(crate) sim: &'a mut Simulation,
    pub(crate) component: ComponentId,
}

fn ensure_setup(sim: &Simulation, what: &str) -> Result<(), ConfigurationError> {
    if sim.phase() != LifecyclePhase::Setup {
        return Err(ConfigurationError::RegistrationClosed {
            what: what.to_string(),
            phase: sim.phase().to_string(),
        });
    }
    Ok(())
}

impl<'a> Builder<'a> {
    /// The merged configuration tree.
    pub fn configuration(&self) -> &ConfigTree {
        &self.sim.configuration
    }

    /// The simulation clock, read-only.
    pub fn clock(&self) -> &dyn SimulationClock {
        self.sim.clock.as_ref()
    }

    /// The name assigned to the component being set up.
    pub fn component_name(&self) -> String {
        self.sim.components.name_of(self.component).to_string()
    }

    pub fn population(&mut self) -> PopulationInterface<'_> {
        PopulationInterface {
            sim: self.sim,
            component: self.component,
        }
    }

    pub fn event(&mut self) -> EventInterface<'_> {
        EventInterface {
            sim: self.sim,
            component: self.component,
        }
    }

    pub fn values(&mut self) -> ValuesInterface<'_> {
        ValuesInterface { sim: self.sim }
    }

    pub fn randomness(&mut self) -> RandomnessInterface<'_> {
        RandomnessInterface { sim: self.sim }
    }

    pub fn results(&mut self) -> ResultsInterface<'_> {
        ResultsInterface { sim: self.sim }
    }

    pub fn components(&mut self) -> ComponentsInterface<'_> {
        ComponentsInterface { sim: self.sim }
    }
}

/// Views onto the state table.
pub struct PopulationInterface<'a> {
    sim: &'a mut Simulation,
    component: ComponentId,
}

impl PopulationInterface<'_> {
    /// A view over the named columns (empty slice = all columns), writable
    /// for the columns this component creates.
    pub fn get_view(&mut self, columns: &[&str]) -> Result<PopulationView, ConfigurationError> {
        self.view(columns, Query::empty())
    }

    /// A view with a default query applied to every read.
    pub fn get_view_with_query(
        &mut self,
        columns: &[&str],
        query: &str,
    ) -> Result<PopulationView, ConfigurationError> {
        let query = Query::parse(query)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        self.view(columns, query)
    }

    fn view(
        &mut self,
        columns: &[&str],
        default_query: Query,
    ) -> Result<PopulationView, ConfigurationError> {
        ensure_setup(self.sim, "a population view")?;
        let component = self.sim.components.name_of(self.component).to_string();
        Ok(self.sim.population.get_view(
            Some(component),
            columns.iter().map(|s| s.to_string()).collect(),
            default_query,
        ))
    }
}

/// Listener registration and emitter handles.
pub struct EventInterface<'a> {
    sim: &'a mut Simulation,
    component: ComponentId,
}

impl EventInterface<'_> {
    /// Listen on a named channel. Lifecycle channels dispatch to the
    /// matching `on_*` hook; any other channel dispatches to `on_event`.
    pub fn register_listener(
        &mut self,
        channel: &str,
        priority: Priority,
    ) -> Result<(), ConfigurationError> {
        ensure_setup(self.sim, "an event listener")?;
        let hook = match channel {
            crate::event::POST_SETUP => HookKind::PostSetup,
            crate::event::TIME_STEP_PREPARE => HookKind::TimeStepPrepare,
            crate::event::TIME_STEP => HookKind::TimeStep,
            crate::event::TIME_STEP_CLEANUP => HookKind::TimeStepCleanup,
            crate::event::COLLECT_METRICS => HookKind::CollectMetrics,
            crate::event::SIMULATION_END => HookKind::SimulationEnd,
            _ => HookKind::Custom,
        };
        self.sim.events.register_listener(
            channel,
            ListenerTarget::Component {
                component: self.component,
                hook,
            },
            priority,
        );
        Ok(())
    }

    /// An emitter for a named channel. Emission from inside a hook is
    /// deferred until the current dispatch completes.
    pub fn get_emitter(&mut self, channel: &str) -> Result<Emitter, ConfigurationError> {
        ensure_setup(self.sim, "an event emitter")?;
        Ok(self.sim.events.get_emitter(channel))
    }
}

/// Pipeline registration.
pub struct ValuesInterface<'a> {
    sim: &'a mut Simulation,
}

impl ValuesInterface<'_> {
    /// Register the single source of a named value.
    pub fn register_value_producer(
        &mut self,
        name: &str,
        source: SourceFn,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<ValueHandle, anyhow::Error> {
        ensure_setup(self.sim, "a value producer")?;
        self.sim.values.register_value_producer(name, source, requires)?;
        Ok(self.sim.values.get_value(name))
    }

    /// Register a source whose annual rates are converted to per-step
    /// probabilities by the pipeline's post-processor.
    pub fn register_rate_producer(
        &mut self,
        name: &str,
        source: SourceFn,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<ValueHandle, anyhow::Error> {
        ensure_setup(self.sim, "a rate producer")?;
        self.sim.values.register_rate_producer(name, source, requires)?;
        Ok(self.sim.values.get_value(name))
    }

    /// Register a source with an explicit post-processor.
    pub fn register_value_producer_with_post(
        &mut self,
        name: &str,
        source: SourceFn,
        post_processor: PostProcessor,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<ValueHandle, anyhow::Error> {
        ensure_setup(self.sim, "a value producer")?;
        self.sim
            .values
            .register_with_post(name, source, Some(post_processor), requires)?;
        Ok(self.sim.values.get_value(name))
    }

    /// Append a modifier to a named value. Modifiers apply in registration
    /// order.
    pub fn register_value_modifier(
        &mut self,
        name: &str,
        modifier: ModifierFn,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<(), ConfigurationError> {
        ensure_setup(self.sim, "a value modifier")?;
        self.sim.values.register_value_modifier(name, modifier, requires);
        Ok(())
    }

    /// A late-bound handle to a named value; the producer may be registered
    /// later in setup.
    pub fn get_value(&mut self, name: &str) -> ValueHandle {
        self.sim.values.get_value(name)
    }
}

/// Stream creation.
pub struct RandomnessInterface<'a> {
    sim: &'a mut Simulation,
}

impl RandomnessInterface<'_> {
    /// A stream of deterministic draws aligned per simulant.
    pub fn get_stream(&mut self, decision_point: &str) -> Result<RandomnessStream, anyhow::Error> {
        ensure_setup(self.sim, "a randomness stream")?;
        Ok(self
            .sim
            .randomness
            .get_randomness_stream(decision_point, false)?)
    }

    /// A stream for generating the key-column values that identify
    /// simulants. Only usable while simulants are being created.
    pub fn get_crn_initializing_stream(
        &mut self,
        decision_point: &str,
    ) -> Result<RandomnessStream, anyhow::Error> {
        ensure_setup(self.sim, "a randomness stream")?;
        Ok(self
            .sim
            .randomness
            .get_randomness_stream(decision_point, true)?)
    }

    /// A seed for external randomness tools, derived from the framework
    /// seed and the current clock time.
    pub fn get_seed(&self, decision_point: &str) -> u64 {
        self.sim
            .randomness
            .get_seed(decision_point, self.sim.clock.time())
    }
}

/// Stratification and observation registration.
pub struct ResultsInterface<'a> {
    sim: &'a mut Simulation,
}

impl ResultsInterface<'_> {
    pub fn register_stratification(
        &mut self,
        name: &str,
        categories: &[&str],
        excluded_categories: &[&str],
        mapper: Option<MapperFn>,
        requires_columns: &[&str],
        requires_values: &[&str],
    ) -> Result<(), anyhow::Error> {
        ensure_setup(self.sim, "a stratification")?;
        self.sim.results.register_stratification(Stratification {
            name: name.to_string(),
            categories: categories.iter().map(|s| s.to_string()).collect(),
            excluded_categories: excluded_categories.iter().map(|s| s.to_string()).collect(),
            mapper,
            requires_columns: requires_columns.iter().map(|s| s.to_string()).collect(),
            requires_values: requires_values.iter().map(|s| s.to_string()).collect(),
        })?;
        Ok(())
    }

    /// A stratification that cuts a numeric column or value into labelled
    /// bins. Expects `edges.len() == labels.len() + 1`.
    pub fn register_binned_stratification(
        &mut self,
        target: &str,
        input: StratificationInput,
        name: &str,
        edges: Vec<f64>,
        labels: &[&str],
        excluded_categories: &[&str],
    ) -> Result<(), ConfigurationError> {
        ensure_setup(self.sim, "a binned stratification")?;
        self.sim.results.register_binned_stratification(
            target,
            input,
            name,
            edges,
            labels.iter().map(|s| s.to_string()).collect(),
            excluded_categories.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn register_adding_observation(
        &mut self,
        params: AddingObservation,
    ) -> Result<(), anyhow::Error> {
        ensure_setup(self.sim, "an observation")?;
        let observation = Observation {
            name: params.name,
            pop_filter: Query::parse(&params.pop_filter)?,
            when: params.when,
            requires_columns: params.requires_columns,
            requires_values: params.requires_values,
            additional_stratifications: params.additional_stratifications,
            excluded_stratifications: params.excluded_stratifications,
            kind: ObservationKind::Adding {
                aggregator: params.aggregator,
            },
            resolved_stratifications: Vec::new(),
            results: ObservationResults::Stratified(Default::default()),
            reporter: params.reporter,
        };
        self.sim.results.add_observation(observation)?;
        Ok(())
    }

    pub fn register_concatenating_observation(
        &mut self,
        params: ConcatenatingObservation,
    ) -> Result<(), anyhow::Error> {
        ensure_setup(self.sim, "an observation")?;
        let mut header = vec!["event_time".to_string()];
        header.extend(params.included_columns.iter().cloned());
        let observation = Observation {
            name: params.name,
            pop_filter: Query::parse(&params.pop_filter)?,
            when: params.when,
            requires_columns: Vec::new(),
            requires_values: Vec::new(),
            additional_stratifications: Vec::new(),
            excluded_stratifications: Vec::new(),
            kind: ObservationKind::Concatenating {
                included_columns: params.included_columns,
            },
            resolved_stratifications: Vec::new(),
            results: ObservationResults::Rows(RowTable {
                header,
                rows: Vec::new(),
            }),
            reporter: params.reporter,
        };
        self.sim.results.add_observation(observation)?;
        Ok(())
    }

    pub fn register_unstratified_observation(
        &mut self,
        params: UnstratifiedObservation,
    ) -> Result<(), anyhow::Error> {
        ensure_setup(self.sim, "an observation")?;
        let observation = Observation {
            name: params.name,
            pop_filter: Query::parse(&params.pop_filter)?,
            when: params.when,
            requires_columns: params.requires_columns,
            requires_values: params.requires_values,
            additional_stratifications: Vec::new(),
            excluded_stratifications: Vec::new(),
            kind: ObservationKind::Unstratified {
                gatherer: params.gatherer,
            },
            resolved_stratifications: Vec::new(),
            results: ObservationResults::Scalars(Vec::new()),
            reporter: params.reporter,
        };
        self.sim.results.add_observation(observation)?;
        Ok(())
    }
}

/// Adding components discovered during setup.
pub struct ComponentsInterface<'a> {
    sim: &'a mut Simulation,
}

impl ComponentsInterface<'_> {
    /// Queue a component; the engine registers and sets it up after the
    /// current component's setup finishes.
    pub fn add(&mut self, component: Box<dyn Component>) -> Result<(), ConfigurationError> {
        ensure_setup(self.sim, "a component")?;
        self.sim.components.queue_component(component)
    }
}
