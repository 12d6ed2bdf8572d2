//! The simulation context and main loop.
//!
//! One process owns one [`SimulationContext`]: the component arena plus a
//! [`Simulation`] bundling the managers. Components and managers are
//! separate fields so event dispatch can hand a hook `&mut Simulation`
//! while holding `&mut` on the component itself.

use crate::builder::Builder;
use crate::clock::{
    build_clock, SimDelta, SimTime, SimulationClock, NEXT_EVENT_TIME_COLUMN, STEP_SIZE_COLUMN,
};
use crate::component::{Component, ComponentId, ComponentManager, LifecyclePhase};
use crate::config::{ConfigTree, ConfigurationError};
use crate::event::{
    Event, EventManager, HookKind, ListenerTarget, Priority, TickPhase, COLLECT_METRICS,
    POST_SETUP, SIMULATION_END, TIME_STEP, TIME_STEP_CLEANUP, TIME_STEP_PREPARE,
};
use crate::population::{
    InitializerId, PopulationManager, Series, SimIndex, SimulantData, Value, TIME_MANAGER_NAME,
};
use crate::randomness::RandomnessManager;
use crate::resource::{ProducerKind, ResourceId, ResourceManager};
use crate::results::ResultsManager;
use crate::values::ValuesManager;
use anyhow::{Context as _, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// The channel emitted after `simulation_end`, just before results are
/// written.
pub const REPORT: &str = "report";

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("the clock failed to advance (step {step} at {time})")]
    NonMonotoneClock { time: String, step: String },
}

/// The managers of a running simulation, as seen from component hooks.
///
/// Hooks receive `&mut Simulation`; pure computations (pipeline sources and
/// modifiers, stream draws) receive `&Simulation` and may re-enter freely.
#[derive(Debug)]
pub struct Simulation {
    pub configuration: ConfigTree,
    pub clock: Box<dyn SimulationClock>,
    pub population: PopulationManager,
    pub resources: ResourceManager,
    pub values: ValuesManager,
    pub events: EventManager,
    pub randomness: RandomnessManager,
    pub results: ResultsManager,
    pub components: ComponentManager,
    phase: LifecyclePhase,
    individual_steps: bool,
    ordered_initializers: Vec<InitializerId>,
}

impl Simulation {
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
    }

    /// Run a named value pipeline for an index.
    pub fn compute_value(&self, name: &str, index: &SimIndex) -> Result<Series> {
        self.values.compute(self, name, index)
    }

    /// Whether per-simulant scheduling columns are in play.
    pub fn individual_steps(&self) -> bool {
        self.individual_steps
    }

    /// Move simulants' next event time (and optionally their step size, in
    /// ticks or days). The scheduling columns are owned by the time system;
    /// this is the only way to write them.
    pub fn reschedule(
        &mut self,
        index: &SimIndex,
        next_event_time: SimTime,
        step_size: Option<f64>,
    ) -> Result<()> {
        anyhow::ensure!(
            self.individual_steps,
            "per-simulant scheduling is disabled; set time.individual_steps to use reschedule"
        );
        self.population.write_engine_column(
            TIME_MANAGER_NAME,
            &Series::times(
                NEXT_EVENT_TIME_COLUMN,
                index.clone(),
                vec![next_event_time; index.len()],
            ),
        )?;
        if let Some(step) = step_size {
            self.population.write_engine_column(
                TIME_MANAGER_NAME,
                &Series::floats(STEP_SIZE_COLUMN, index.clone(), vec![step; index.len()]),
            )?;
        }
        Ok(())
    }

    fn step_delta(&self, magnitude: f64) -> SimDelta {
        match self.clock.step_size() {
            SimDelta::Ticks(_) => SimDelta::Ticks(magnitude.round() as i64),
            SimDelta::Span(_) => {
                use hifitime::TimeUnits;
                SimDelta::Span(magnitude.days())
            }
        }
    }

    fn step_magnitude(&self, delta: SimDelta) -> f64 {
        match delta {
            SimDelta::Ticks(t) => t as f64,
            SimDelta::Span(d) => d.to_unit(hifitime::Unit::Day),
        }
    }

    /// Initialize the scheduling columns for new simulants: first due one
    /// creation window out, stepping at the global step size.
    fn initialize_schedule(&mut self, data: &SimulantData) -> Result<()> {
        let due = data.creation_time + data.creation_window;
        self.population.write_engine_column(
            TIME_MANAGER_NAME,
            &Series::times(
                NEXT_EVENT_TIME_COLUMN,
                data.index.clone(),
                vec![due; data.index.len()],
            ),
        )?;
        let step = self.step_magnitude(self.clock.step_size());
        self.population.write_engine_column(
            TIME_MANAGER_NAME,
            &Series::floats(
                STEP_SIZE_COLUMN,
                data.index.clone(),
                vec![step; data.index.len()],
            ),
        )?;
        Ok(())
    }

    /// The simulants due within the coming global step.
    fn scheduled_subset(&self, index: &SimIndex) -> Result<SimIndex> {
        let horizon = self.clock.time() + self.clock.step_size();
        let column = self
            .population
            .table()
            .column(NEXT_EVENT_TIME_COLUMN)
            .expect("scheduling columns exist when individual_steps is on");
        Ok(index
            .iter()
            .copied()
            .filter(|&row| match column.get(row) {
                Some(Value::Time(due)) => due <= horizon,
                _ => true,
            })
            .collect())
    }

    /// The smallest per-simulant step among tracked simulants, if any.
    fn min_simulant_step(&self) -> Option<SimDelta> {
        let tracked = self
            .population
            .tracked_subset(&self.population.full_index());
        let column = self.population.table().column(STEP_SIZE_COLUMN)?;
        let mut min: Option<f64> = None;
        for &row in tracked.iter() {
            if let Some(Value::Float(step)) = column.get(row) {
                min = Some(min.map_or(step, |m: f64| m.min(step)));
            }
        }
        min.map(|m| self.step_delta(m))
    }

    /// Push overdue simulants' next event time forward by their own step.
    fn advance_schedule(&mut self) -> Result<()> {
        let now = self.clock.time();
        let table = self.population.table();
        let due_column = table
            .column(NEXT_EVENT_TIME_COLUMN)
            .expect("scheduling columns exist when individual_steps is on");
        let step_column = table
            .column(STEP_SIZE_COLUMN)
            .expect("scheduling columns exist when individual_steps is on");
        let mut rows = Vec::new();
        let mut times = Vec::new();
        for row in 0..table.len() {
            if let (Some(Value::Time(due)), Some(Value::Float(step))) =
                (due_column.get(row), step_column.get(row))
            {
                if due <= now {
                    rows.push(row);
                    times.push(now + self.step_delta(step));
                }
            }
        }
        if !rows.is_empty() {
            self.population.write_engine_column(
                TIME_MANAGER_NAME,
                &Series::times(NEXT_EVENT_TIME_COLUMN, SimIndex::new(rows), times),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    random_seed: String,
    population_size: i64,
    start_time: String,
    end_time: String,
    simulation_run_time_seconds: f64,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Owns the components and the managers; drives the lifecycle.
pub struct SimulationContext {
    components: Vec<Box<dyn Component>>,
    sim: Simulation,
    started: std::time::Instant,
    start_time_label: String,
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("components", &self.components.len())
            .field("sim", &self.sim)
            .field("started", &self.started)
            .field("start_time_label", &self.start_time_label)
            .finish()
    }
}

impl SimulationContext {
    /// Build a context from user components and an optional YAML overlay of
    /// configuration overrides. Component configuration defaults are merged
    /// as each component is added; nested components are flattened
    /// depth-first.
    pub fn new(
        components: Vec<Box<dyn Component>>,
        overrides: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let mut configuration = ConfigTree::new();
        configuration.update_yaml_str(
            "population:\n  population_size: 100\n",
            "base",
            "population_manager",
        )?;
        configuration.update_yaml_str(
            RandomnessManager::CONFIGURATION_DEFAULTS,
            "base",
            "randomness_manager",
        )?;
        configuration.update_yaml_str(
            ResultsManager::CONFIGURATION_DEFAULTS,
            "base",
            "results_manager",
        )?;
        configuration.update_yaml_str("time:\n  individual_steps: false\n", "base", TIME_MANAGER_NAME)?;
        if let Some(overrides) = overrides {
            configuration.update_yaml_str(overrides, "override", "user_override")?;
        }

        let mut component_manager = ComponentManager::new();
        let mut arena: Vec<Box<dyn Component>> = Vec::new();
        for component in components {
            add_component(&mut component_manager, &mut configuration, &mut arena, component)?;
        }

        let clock = build_clock(&mut configuration)?;
        let randomness = RandomnessManager::from_config(&configuration)?;
        let start_time_label = clock.time().to_string();

        Ok(SimulationContext {
            components: arena,
            sim: Simulation {
                configuration,
                clock,
                population: PopulationManager::new(),
                resources: ResourceManager::new(),
                values: ValuesManager::new(),
                events: EventManager::new(),
                randomness,
                results: ResultsManager::new(),
                components: component_manager,
                phase: LifecyclePhase::Bootstrap,
                individual_steps: false,
                ordered_initializers: Vec::new(),
            },
            started: std::time::Instant::now(),
            start_time_label,
        })
    }

    /// Read-only access to the managers, for embedding code and tests.
    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn simulation_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    /// Run manager and component setup, freeze the configuration and the
    /// resource graph, and emit `post_setup`.
    pub fn setup(&mut self) -> Result<()> {
        self.sim.set_phase(LifecyclePhase::Setup);
        self.sim.results.configure(&self.sim.configuration)?;
        self.sim.individual_steps = self.sim.configuration.get_bool("time.individual_steps")?;

        for channel in [TIME_STEP_PREPARE, TIME_STEP, TIME_STEP_CLEANUP, COLLECT_METRICS] {
            self.sim.events.register_listener(
                channel,
                ListenerTarget::ResultsGather,
                Priority::default(),
            );
        }

        if self.sim.individual_steps {
            let columns = vec![
                NEXT_EVENT_TIME_COLUMN.to_string(),
                STEP_SIZE_COLUMN.to_string(),
            ];
            self.sim.population.register_initializer(
                InitializerId::Scheduling,
                TIME_MANAGER_NAME,
                &columns,
            )?;
            self.sim.resources.add_producer(
                TIME_MANAGER_NAME,
                ProducerKind::Initializer(InitializerId::Scheduling),
                columns.iter().map(ResourceId::column).collect(),
                Vec::new(),
            )?;
        }

        let mut idx = 0;
        while idx < self.components.len() {
            self.setup_component(ComponentId(idx))
                .with_context(|| {
                    format!("setting up component '{}'", self.sim.components.name_of(ComponentId(idx)))
                })?;
            for queued in self.sim.components.take_pending() {
                add_component(
                    &mut self.sim.components,
                    &mut self.sim.configuration,
                    &mut self.components,
                    queued,
                )?;
            }
            idx += 1;
        }

        // Pipelines and streams join the resource graph once everything is
        // registered, then the graph and configuration freeze.
        let pipeline_nodes: Vec<(String, Vec<ResourceId>)> = self
            .sim
            .values
            .declared_requirements()
            .filter(|(name, _)| self.sim.values.has_source(name))
            .map(|(name, requires)| (name.to_string(), requires.to_vec()))
            .collect();
        for (name, requires) in pipeline_nodes {
            let id = ResourceId::value(&name);
            self.sim.resources.add_producer(
                &id.to_string(),
                ProducerKind::Pipeline,
                vec![id.clone()],
                requires,
            )?;
        }
        let stream_nodes: Vec<(String, bool)> = self
            .sim
            .randomness
            .registered_streams()
            .map(|(key, initializes)| (key.to_string(), initializes))
            .collect();
        for (key, initializes_crn_attributes) in stream_nodes {
            let id = ResourceId::stream(&key);
            let requires = if initializes_crn_attributes {
                Vec::new()
            } else {
                self.sim
                    .randomness
                    .key_columns()
                    .iter()
                    .map(ResourceId::column)
                    .collect()
            };
            self.sim.resources.add_producer(
                &id.to_string(),
                ProducerKind::Stream,
                vec![id.clone()],
                requires,
            )?;
        }

        self.sim.ordered_initializers = self.sim.resources.ordered_initializers()?;
        self.sim.components.freeze();
        self.sim.configuration.freeze();

        self.sim.set_phase(LifecyclePhase::PostSetup);
        self.sim.results.finalize_registrations()?;
        self.emit(POST_SETUP, SimIndex::empty(), HashMap::new())?;
        Ok(())
    }

    fn setup_component(&mut self, id: ComponentId) -> Result<()> {
        let name = self.sim.components.name_of(id).to_string();
        let component = &mut self.components[id.0];

        if component.initializes_simulants() {
            let columns = component.columns_created();
            self.sim.population.register_initializer(
                InitializerId::Component(id),
                &name,
                &columns,
            )?;
            self.sim.resources.add_producer(
                &name,
                ProducerKind::Initializer(InitializerId::Component(id)),
                columns.iter().map(ResourceId::column).collect(),
                component.initialization_requires(),
            )?;
        }

        let subscriptions = [
            (component.post_setup_priority(), POST_SETUP, HookKind::PostSetup),
            (
                component.time_step_prepare_priority(),
                TIME_STEP_PREPARE,
                HookKind::TimeStepPrepare,
            ),
            (component.time_step_priority(), TIME_STEP, HookKind::TimeStep),
            (
                component.time_step_cleanup_priority(),
                TIME_STEP_CLEANUP,
                HookKind::TimeStepCleanup,
            ),
            (
                component.collect_metrics_priority(),
                COLLECT_METRICS,
                HookKind::CollectMetrics,
            ),
            (
                component.simulation_end_priority(),
                SIMULATION_END,
                HookKind::SimulationEnd,
            ),
        ];
        for (priority, channel, hook) in subscriptions {
            if let Some(priority) = priority {
                self.sim.events.register_listener(
                    channel,
                    ListenerTarget::Component { component: id, hook },
                    priority,
                );
            }
        }

        let mut builder = Builder {
            sim: &mut self.sim,
            component: id,
        };
        component.setup(&mut builder)
    }

    /// Create the initial population, running every simulant initializer in
    /// resource-dependency order.
    pub fn initialize_simulants(&mut self) -> Result<SimIndex> {
        let size = self
            .sim
            .configuration
            .get_int("population.population_size")?
            .max(0) as usize;
        self.create_simulants_inner(size, HashMap::new(), true)
    }

    /// Add simulants mid-simulation. Components should prefer
    /// `sim.population.queue_simulants`, which routes here between
    /// dispatches.
    pub fn create_simulants(
        &mut self,
        count: usize,
        user_data: HashMap<String, Value>,
    ) -> Result<SimIndex> {
        self.create_simulants_inner(count, user_data, false)
    }

    fn create_simulants_inner(
        &mut self,
        count: usize,
        user_data: HashMap<String, Value>,
        initial: bool,
    ) -> Result<SimIndex> {
        let prior_phase = self.sim.phase();
        self.sim.set_phase(LifecyclePhase::PopulationCreation);
        let index = self.sim.population.begin_creation(count, initial);
        debug!(count, initial, "creating simulants");

        if count > 0 {
            let data = SimulantData {
                index: index.clone(),
                user_data,
                creation_time: self.sim.clock.time(),
                creation_window: self.sim.clock.step_size(),
            };
            for initializer in self.sim.ordered_initializers.clone() {
                match initializer {
                    InitializerId::Component(id) => {
                        let component = &mut self.components[id.0];
                        component
                            .on_initialize_simulants(&data, &mut self.sim)
                            .with_context(|| {
                                format!(
                                    "initializing simulants in '{}'",
                                    self.sim.components.name_of(id)
                                )
                            })?;
                    }
                    InitializerId::Scheduling => self.sim.initialize_schedule(&data)?,
                }
            }
        }

        self.sim.population.end_creation();
        self.sim.set_phase(prior_phase);
        Ok(index)
    }

    /// Emit one event synchronously: listeners fire in priority order, then
    /// any queued simulant creations and deferred emissions drain.
    pub fn emit(
        &mut self,
        channel: &str,
        index: SimIndex,
        user_data: HashMap<String, Value>,
    ) -> Result<()> {
        if let Some(phase) = lifecycle_phase_of(channel) {
            self.sim.set_phase(phase);
        }
        let event = Event {
            index,
            time: self.sim.clock.time(),
            step_size: self.sim.clock.step_size(),
            user_data,
        };
        for target in self.sim.events.listeners(channel) {
            self.dispatch(target, channel, &event)?;
        }
        self.drain_queues()?;
        Ok(())
    }

    fn dispatch(&mut self, target: ListenerTarget, channel: &str, event: &Event) -> Result<()> {
        match target {
            ListenerTarget::Component { component, hook } => {
                let hook_result = {
                    let value = &mut self.components[component.0];
                    match hook {
                        HookKind::PostSetup => value.on_post_setup(event, &mut self.sim),
                        HookKind::TimeStepPrepare => value.on_time_step_prepare(event, &mut self.sim),
                        HookKind::TimeStep => value.on_time_step(event, &mut self.sim),
                        HookKind::TimeStepCleanup => value.on_time_step_cleanup(event, &mut self.sim),
                        HookKind::CollectMetrics => value.on_collect_metrics(event, &mut self.sim),
                        HookKind::SimulationEnd => value.on_simulation_end(event, &mut self.sim),
                        HookKind::Custom => value.on_event(channel, event, &mut self.sim),
                    }
                };
                hook_result.with_context(|| {
                    format!(
                        "in '{}' listening on '{channel}'",
                        self.sim.components.name_of(component)
                    )
                })
            }
            ListenerTarget::ResultsGather => {
                let Some(phase) = TickPhase::from_channel(channel) else {
                    return Ok(());
                };
                let updates = self.sim.results.gather_updates(&self.sim, phase, event)?;
                self.sim.results.apply_updates(updates);
                Ok(())
            }
        }
    }

    fn drain_queues(&mut self) -> Result<()> {
        loop {
            if let Some((count, user_data)) = self.sim.population.take_queued_creation() {
                self.create_simulants_inner(count, user_data, false)?;
                continue;
            }
            if let Some((channel, index, user_data)) = self.sim.events.take_deferred() {
                self.emit(&channel, index, user_data)?;
                continue;
            }
            return Ok(());
        }
    }

    /// One tick: the four phase channels against the active population,
    /// then the clock advances.
    pub fn step(&mut self) -> Result<()> {
        let full = self.sim.population.full_index();
        let active = if self.sim.individual_steps {
            self.sim.scheduled_subset(&full)?
        } else {
            full
        };

        for channel in [TIME_STEP_PREPARE, TIME_STEP, TIME_STEP_CLEANUP, COLLECT_METRICS] {
            self.emit(channel, active.clone(), HashMap::new())?;
        }

        let mut delta = self.sim.clock.step_size();
        if self.sim.individual_steps {
            if let Some(min_step) = self.sim.min_simulant_step() {
                delta = delta.min(min_step);
            }
        }
        if !delta.is_positive() {
            return Err(FatalError::NonMonotoneClock {
                time: self.sim.clock.time().to_string(),
                step: delta.to_string(),
            }
            .into());
        }
        self.sim.clock.advance(delta);
        if self.sim.individual_steps {
            self.sim.advance_schedule()?;
        }
        Ok(())
    }

    /// Step until the clock reaches its stop time.
    pub fn run(&mut self) -> Result<()> {
        let mut steps = 0u64;
        while !self.sim.clock.is_finished() {
            self.step()?;
            steps += 1;
        }
        info!(
            steps,
            population = self.sim.population.len(),
            "simulation loop finished"
        );
        Ok(())
    }

    /// Emit `simulation_end`.
    pub fn finalize(&mut self) -> Result<()> {
        let index = self.sim.population.full_index();
        self.emit(SIMULATION_END, index, HashMap::new())
    }

    /// Emit `report`, hand observations their accumulated results, and
    /// write the run's output into a timestamped subdirectory of
    /// `results_root`: `metadata.yaml` plus one `{observation}.csv` per
    /// observation without a custom reporter.
    pub fn report(&mut self, results_root: &Path) -> Result<PathBuf> {
        let index = self.sim.population.full_index();
        self.emit(REPORT, index, HashMap::new())?;
        self.sim.set_phase(LifecyclePhase::Report);

        let directory = results_root.join(run_timestamp());
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("creating results directory {}", directory.display()))?;

        for (name, results) in self.sim.results.report_all()? {
            let path = directory.join(format!("{name}.csv"));
            std::fs::write(&path, results.to_csv())
                .with_context(|| format!("writing {}", path.display()))?;
        }
        self.write_metadata(&directory, "complete", None)?;
        info!(directory = %directory.display(), "results written");
        Ok(directory)
    }

    fn write_metadata(
        &self,
        directory: &Path,
        status: &str,
        error: Option<String>,
    ) -> Result<()> {
        let metadata = RunMetadata {
            random_seed: self.sim.randomness.seed_str().to_string(),
            population_size: self.sim.population.len() as i64,
            start_time: self.start_time_label.clone(),
            end_time: self.sim.clock.time().to_string(),
            simulation_run_time_seconds: self.started.elapsed().as_secs_f64(),
            status: status.to_string(),
            error,
        };
        let path = directory.join("metadata.yaml");
        let body = serde_yaml::to_string(&metadata)?;
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// The whole lifecycle: setup, population creation, the loop,
    /// finalization, and reporting. On failure a partial metadata record is
    /// still written under `results_root`.
    pub fn run_full(&mut self, results_root: &Path) -> Result<PathBuf> {
        let outcome = self
            .setup()
            .and_then(|_| self.initialize_simulants().map(|_| ()))
            .and_then(|_| self.run())
            .and_then(|_| self.finalize())
            .and_then(|_| self.report(results_root));
        match outcome {
            Ok(directory) => Ok(directory),
            Err(error) => {
                let directory = results_root.join(run_timestamp());
                if std::fs::create_dir_all(&directory).is_ok() {
                    let _ = self.write_metadata(&directory, "error", Some(format!("{error:#}")));
                }
                Err(error)
            }
        }
    }
}

fn add_component(
    manager: &mut ComponentManager,
    configuration: &mut ConfigTree,
    arena: &mut Vec<Box<dyn Component>>,
    mut component: Box<dyn Component>,
) -> Result<(), ConfigurationError> {
    let nested = component.sub_components();
    let id = manager.register(component.as_ref(), configuration)?;
    debug_assert_eq!(id.0, arena.len());
    arena.push(component);
    for sub in nested {
        add_component(manager, configuration, arena, sub)?;
    }
    Ok(())
}

fn lifecycle_phase_of(channel: &str) -> Option<LifecyclePhase> {
    match channel {
        POST_SETUP => Some(LifecyclePhase::PostSetup),
        TIME_STEP_PREPARE => Some(LifecyclePhase::TimeStepPrepare),
        TIME_STEP => Some(LifecyclePhase::TimeStep),
        TIME_STEP_CLEANUP => Some(LifecyclePhase::TimeStepCleanup),
        COLLECT_METRICS => Some(LifecyclePhase::CollectMetrics),
        SIMULATION_END => Some(LifecyclePhase::SimulationEnd),
        REPORT => Some(LifecyclePhase::Report),
        _ => None,
    }
}

fn run_timestamp() -> String {
    let now = hifitime::Epoch::now().unwrap_or_else(|_| hifitime::Epoch::from_tai_seconds(0.0));
    let (year, month, day, hour, minute, second, _) = now.to_gregorian_utc();
    format!("{year:04}_{month:02}_{day:02}_{hour:02}_{minute:02}_{second:02}")
}
