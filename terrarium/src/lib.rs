//! # Terrarium
//!
//! A discrete-event microsimulation engine for population-based,
//! individual-level models.
//!
//! Terrarium simulates a population of *simulants* — rows of a wide,
//! columnar state table — advanced through time by a set of cooperating
//! *components*. Components never touch each other or the table directly:
//! they read and write column slices through mediated views, react to
//! lifecycle events in priority order, compose *value pipelines* that other
//! components may modify, and draw randomness from keyed streams that stay
//! aligned per individual across counterfactual runs (Common Random
//! Numbers). A results system turns the evolving table into stratified
//! measures without the model code doing any bookkeeping.
//!
//! The engine is single-threaded and cooperative: one
//! [`SimulationContext`] owns everything, and a tick is a fixed sequence of
//! event channels (`time_step__prepare`, `time_step`, `time_step__cleanup`,
//! `collect_metrics`) emitted against the current population. Determinism
//! is a design constraint throughout — registration orders are preserved,
//! resource ordering is topological with stable tie-breaks, and every draw
//! is a pure function of (stream, clock, seed).
//!
//! ## Concepts
//!
//! - **State table** — one row per simulant; typed columns, each owned by
//!   the component that created it. Only the creator may write a column.
//! - **Component** — anything implementing [`Component`]: a name, a
//!   `setup` hook for registering views, streams, pipelines, and
//!   observations, and per-phase event hooks.
//! - **Resource graph** — components declare what their simulant
//!   initializers produce and require; initializers run in topological
//!   order, so a component can rely on the columns it asked for.
//! - **Pipeline** — a named value: one source plus an ordered chain of
//!   modifiers contributed by other components, with optional
//!   post-processing (e.g. annual rates to per-step probabilities).
//! - **Randomness stream** — deterministic uniforms keyed by stream name,
//!   clock time, and the global seed. With key columns configured, draws
//!   are positioned by each simulant's identity tuple, so the same
//!   individual sees the same randomness in an intervention run and its
//!   baseline.
//! - **Observation** — a registered measure (count, sum, custom aggregate)
//!   gathered each tick over a stratified, filtered population.
//!
//! ## A tiny model
//!
//! ```no_run
//! use terrarium::prelude::*;
//!
//! /// Gives every simulant an age and grows it each step.
//! struct Aging {
//!     view: Option<PopulationView>,
//! }
//!
//! impl Component for Aging {
//!     fn name(&self) -> String {
//!         "aging".to_string()
//!     }
//!
//!     fn columns_created(&self) -> Vec<String> {
//!         vec!["age".to_string()]
//!     }
//!
//!     fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
//!         self.view = Some(builder.population().get_view(&["age"])?);
//!         Ok(())
//!     }
//!
//!     fn on_initialize_simulants(
//!         &mut self,
//!         data: &SimulantData,
//!         sim: &mut Simulation,
//!     ) -> Result<()> {
//!         let ages = Series::floats("age", data.index.clone(), vec![0.0; data.index.len()]);
//!         self.view.as_ref().unwrap().update(&mut sim.population, ages)?;
//!         Ok(())
//!     }
//!
//!     fn time_step_priority(&self) -> Option<Priority> {
//!         Some(Priority::default())
//!     }
//!
//!     fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
//!         let view = self.view.as_ref().unwrap();
//!         let ages = view.get(&sim.population, &event.index, "")?.series("age")?;
//!         let grown: Vec<f64> = ages.as_floats()?.iter().map(|a| a + 1.0).collect();
//!         view.update(
//!             &mut sim.population,
//!             Series::floats("age", ages.index.clone(), grown),
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut context = SimulationContext::new(
//!         vec![Box::new(Aging { view: None })],
//!         Some("population:\n  population_size: 1000\ntime:\n  end: 50\n"),
//!     )?;
//!     context.setup()?;
//!     context.initialize_simulants()?;
//!     context.run()?;
//!     context.finalize()?;
//!     context.report(std::path::Path::new("results"))?;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod clock;
pub mod component;
pub mod config;
pub mod event;
pub mod population;
pub mod randomness;
pub mod resource;
pub mod results;
pub mod simulation;
pub mod values;

pub use crate::builder::Builder;
pub use crate::clock::{DateTimeClock, SimDelta, SimTime, SimpleClock, SimulationClock};
pub use crate::component::{Component, ComponentId, LifecyclePhase};
pub use crate::config::{ConfigTree, ConfigValue, ConfigurationError};
pub use crate::event::{Emitter, Event, Priority, TickPhase};
pub use crate::population::{
    DType, Frame, PopulationError, PopulationView, Query, Series, SeriesValues, SimIndex,
    SimulantData, Value,
};
pub use crate::randomness::{
    ChoiceWeights, Probabilities, RandomnessError, RandomnessStream, Weight, RESIDUAL_CHOICE,
};
pub use crate::results::{
    aggregators, AddingObservation, ConcatenatingObservation, ObservationResults,
    StratificationInput, UnstratifiedObservation,
};
pub use crate::simulation::{Simulation, SimulationContext};
pub use crate::values::{PostProcessor, ValueHandle, ValuesError};

pub use anyhow::{anyhow, bail, Context, Error, Result};

/// The common imports for writing components.
pub mod prelude {
    pub use crate::builder::Builder;
    pub use crate::clock::{SimDelta, SimTime};
    pub use crate::component::Component;
    pub use crate::event::{Event, Priority, TickPhase};
    pub use crate::population::{
        Frame, PopulationView, Series, SimIndex, SimulantData, Value,
    };
    pub use crate::randomness::{RandomnessStream, Weight, RESIDUAL_CHOICE};
    pub use crate::results::{
        aggregators, AddingObservation, ConcatenatingObservation, UnstratifiedObservation,
    };
    pub use crate::simulation::{Simulation, SimulationContext};
    pub use crate::values::ValueHandle;
    pub use anyhow::Result;
}
