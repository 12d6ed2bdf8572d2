//! The results system: stratifications, observations, and their
//! accumulated measures.

pub mod observation;
pub mod stratification;

pub use observation::{
    aggregators, AddingObservation, AggregatorFn, ConcatenatingObservation, GathererFn,
    ObservationResults, ReporterFn, RowTable, StratifiedTable, UnstratifiedObservation,
};
pub use stratification::{MapperFn, Stratification};

use crate::config::{ConfigTree, ConfigurationError};
use crate::event::{Event, TickPhase};
use crate::population::{Series, Value};
use crate::simulation::Simulation;
use indexmap::IndexMap;
use observation::{Observation, ObservationKind};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("a stratification named '{0}' is already registered")]
    DuplicateStratification(String),
    #[error("an observation named '{0}' is already registered")]
    DuplicateObservation(String),
    #[error("stratification '{stratification}' produced unknown category '{value}'")]
    UnknownCategory {
        stratification: String,
        value: String,
    },
    #[error("stratification '{stratification}' has no input columns or values")]
    NoInputs { stratification: String },
    #[error("stratification '{stratification}' produced {found} labels for {expected} rows")]
    MapperLengthMismatch {
        stratification: String,
        expected: usize,
        found: usize,
    },
    #[error("stratification '{stratification}' mapper failed: {message}")]
    MapperFailed {
        stratification: String,
        message: String,
    },
}

/// The input kind of a binned stratification target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratificationInput {
    Column,
    Value,
}

/// One accumulated change produced by a gather pass.
pub(crate) enum ResultsUpdate {
    AddCell {
        observation: usize,
        key: Vec<String>,
        value: f64,
    },
    AppendRows {
        observation: usize,
        rows: Vec<Vec<String>>,
    },
    Scalar {
        observation: usize,
        time: String,
        value: f64,
    },
}

/// Registry and accumulator for all measurement in a simulation.
#[derive(Default)]
pub struct ResultsManager {
    default_stratifications: Vec<String>,
    stratifications: IndexMap<String, Stratification>,
    observations: Vec<Observation>,
}

impl std::fmt::Debug for ResultsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsManager")
            .field("default_stratifications", &self.default_stratifications)
            .field(
                "stratifications",
                &self.stratifications.keys().collect::<Vec<_>>(),
            )
            .field(
                "observations",
                &self.observations.iter().map(|o| &o.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ResultsManager {
    pub const CONFIGURATION_DEFAULTS: &'static str = "\
stratification:
  default: []
";

    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn configure(&mut self, config: &ConfigTree) -> Result<(), ConfigurationError> {
        self.default_stratifications = config.get_str_list("stratification.default")?;
        Ok(())
    }

    pub fn stratification_names(&self) -> impl Iterator<Item = &str> {
        self.stratifications.keys().map(String::as_str)
    }

    pub fn observation_names(&self) -> impl Iterator<Item = &str> {
        self.observations.iter().map(|o| o.name.as_str())
    }

    pub(crate) fn register_stratification(
        &mut self,
        stratification: Stratification,
    ) -> Result<(), ResultsError> {
        if self.stratifications.contains_key(&stratification.name) {
            return Err(ResultsError::DuplicateStratification(
                stratification.name.clone(),
            ));
        }
        debug!(name = stratification.name, "registered stratification");
        self.stratifications
            .insert(stratification.name.clone(), stratification);
        Ok(())
    }

    pub(crate) fn register_binned_stratification(
        &mut self,
        target: &str,
        input: StratificationInput,
        name: &str,
        edges: Vec<f64>,
        labels: Vec<String>,
        excluded_categories: Vec<String>,
    ) -> Result<(), ConfigurationError> {
        if edges.len() != labels.len() + 1 {
            return Err(ConfigurationError::BinMismatch {
                name: name.to_string(),
                edges: edges.len(),
                labels: labels.len(),
            });
        }
        let (requires_columns, requires_values) = match input {
            StratificationInput::Column => (vec![target.to_string()], vec![]),
            StratificationInput::Value => (vec![], vec![target.to_string()]),
        };
        let stratification = Stratification {
            name: name.to_string(),
            categories: labels.clone(),
            excluded_categories,
            mapper: Some(stratification::binned_mapper(
                target.to_string(),
                edges,
                labels,
            )),
            requires_columns,
            requires_values,
        };
        self.register_stratification(stratification)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    pub(crate) fn add_observation(&mut self, observation: Observation) -> Result<(), ResultsError> {
        if self.observations.iter().any(|o| o.name == observation.name) {
            return Err(ResultsError::DuplicateObservation(observation.name.clone()));
        }
        debug!(name = observation.name, "registered observation");
        self.observations.push(observation);
        Ok(())
    }

    /// Resolve every observation's stratifications and build the zero-filled
    /// accumulators. All unknown references are collected into one error.
    pub(crate) fn finalize_registrations(&mut self) -> Result<(), ConfigurationError> {
        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut used: Vec<String> = Vec::new();

        for observation in &mut self.observations {
            if !matches!(observation.kind, ObservationKind::Adding { .. }) {
                continue;
            }
            let mut resolved: Vec<String> = Vec::new();
            for name in self
                .default_stratifications
                .iter()
                .chain(&observation.additional_stratifications)
            {
                if !observation.excluded_stratifications.contains(name) && !resolved.contains(name) {
                    resolved.push(name.clone());
                }
            }

            let unknown: Vec<String> = resolved
                .iter()
                .filter(|name| !self.stratifications.contains_key(*name))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                let mut unknown = unknown;
                unknown.sort();
                missing.insert(observation.name.clone(), unknown);
                continue;
            }

            used.extend(resolved.iter().cloned());
            let table = if resolved.is_empty() {
                StratifiedTable::zeros(
                    vec!["stratification".to_string()],
                    &[vec!["all".to_string()]],
                )
            } else {
                let category_sets: Vec<Vec<String>> = resolved
                    .iter()
                    .map(|name| self.stratifications[name].active_categories())
                    .collect();
                StratifiedTable::zeros(resolved.clone(), &category_sets)
            };
            observation.resolved_stratifications = resolved;
            observation.results = ObservationResults::Stratified(table);
        }

        if !missing.is_empty() {
            let description = missing
                .iter()
                .map(|(observation, names)| format!("{observation}: {}", names.join(", ")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigurationError::UnknownStratifications(description));
        }

        let unused: Vec<&str> = self
            .stratifications
            .keys()
            .filter(|name| !used.contains(name))
            .map(String::as_str)
            .collect();
        if !unused.is_empty() {
            info!(
                ?unused,
                "stratifications are registered but not used by any observation"
            );
        }
        Ok(())
    }

    /// Compute this phase's updates against a read-only view of the
    /// simulation. Application is a separate, mutating step so observation
    /// inputs (views, pipelines) stay shareable during the pass.
    pub(crate) fn gather_updates(
        &self,
        sim: &Simulation,
        phase: TickPhase,
        event: &Event,
    ) -> anyhow::Result<Vec<ResultsUpdate>> {
        let interested: Vec<usize> = self
            .observations
            .iter()
            .enumerate()
            .filter(|(_, o)| o.when == phase)
            .map(|(idx, _)| idx)
            .collect();
        if interested.is_empty() {
            return Ok(Vec::new());
        }

        let frame = self.prepare_population(sim, &interested, event)?;

        let mut updates = Vec::new();
        for idx in interested {
            let observation = &self.observations[idx];
            let positions = frame.filter_positions(&observation.pop_filter)?;
            let subframe = frame.take_rows(&positions);

            match &observation.kind {
                ObservationKind::Adding { aggregator } => {
                    let labels: Vec<Vec<Option<String>>> = observation
                        .resolved_stratifications
                        .iter()
                        .map(|name| self.stratifications[name].apply(&subframe))
                        .collect::<Result<_, _>>()?;

                    let mut groups: IndexMap<Vec<String>, Vec<usize>> = IndexMap::new();
                    'rows: for pos in 0..subframe.len() {
                        let mut key = Vec::with_capacity(labels.len().max(1));
                        for stratification in &labels {
                            match &stratification[pos] {
                                Some(label) => key.push(label.clone()),
                                None => continue 'rows,
                            }
                        }
                        if labels.is_empty() {
                            key.push("all".to_string());
                        }
                        groups.entry(key).or_default().push(pos);
                    }
                    for (key, rows) in groups {
                        let value = aggregator(&subframe.take_rows(&rows))?;
                        updates.push(ResultsUpdate::AddCell {
                            observation: idx,
                            key,
                            value,
                        });
                    }
                }
                ObservationKind::Concatenating { included_columns } => {
                    let event_time = event.time + event.step_size;
                    let mut rows = Vec::with_capacity(subframe.len());
                    for pos in 0..subframe.len() {
                        let mut row = vec![event_time.to_string()];
                        for column in included_columns {
                            let cell = subframe.cell(pos, column).ok_or_else(|| {
                                anyhow::anyhow!(
                                    "observation '{}' includes unknown column '{column}'",
                                    observation.name
                                )
                            })?;
                            row.push(cell.to_string());
                        }
                        rows.push(row);
                    }
                    updates.push(ResultsUpdate::AppendRows {
                        observation: idx,
                        rows,
                    });
                }
                ObservationKind::Unstratified { gatherer } => {
                    updates.push(ResultsUpdate::Scalar {
                        observation: idx,
                        time: event.time.to_string(),
                        value: gatherer(&subframe)?,
                    });
                }
            }
        }
        Ok(updates)
    }

    pub(crate) fn apply_updates(&mut self, updates: Vec<ResultsUpdate>) {
        for update in updates {
            match update {
                ResultsUpdate::AddCell {
                    observation,
                    key,
                    value,
                } => {
                    if let ObservationResults::Stratified(table) =
                        &mut self.observations[observation].results
                    {
                        table.add(key, value);
                    }
                }
                ResultsUpdate::AppendRows { observation, rows } => {
                    if let ObservationResults::Rows(table) =
                        &mut self.observations[observation].results
                    {
                        table.rows.extend(rows);
                    }
                }
                ResultsUpdate::Scalar {
                    observation,
                    time,
                    value,
                } => {
                    if let ObservationResults::Scalars(values) =
                        &mut self.observations[observation].results
                    {
                        values.push((time, value));
                    }
                }
            }
        }
    }

    /// The accumulated results of one observation.
    pub fn results_for(&self, name: &str) -> Option<&ObservationResults> {
        self.observations
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.results)
    }

    /// Run custom reporters and return the observations the engine should
    /// write out itself.
    pub(crate) fn report_all(&mut self) -> anyhow::Result<Vec<(String, ObservationResults)>> {
        let mut unreported = Vec::new();
        for observation in &mut self.observations {
            match &mut observation.reporter {
                Some(reporter) => reporter(&observation.name, &observation.results)?,
                None => {
                    unreported.push((observation.name.clone(), observation.results.clone()));
                }
            }
        }
        Ok(unreported)
    }

    /// Build the per-phase population frame: required columns, synthetic
    /// time fields, event data, and pipeline values.
    fn prepare_population(
        &self,
        sim: &Simulation,
        interested: &[usize],
        event: &Event,
    ) -> anyhow::Result<crate::population::Frame> {
        let mut columns: Vec<String> = vec![crate::population::TRACKED_COLUMN.to_string()];
        let mut values: Vec<String> = Vec::new();
        let mut add_unique = |list: &mut Vec<String>, name: &String| {
            if !list.contains(name) && !is_synthetic(name) {
                list.push(name.clone());
            }
        };
        for &idx in interested {
            let observation = &self.observations[idx];
            for column in &observation.requires_columns {
                add_unique(&mut columns, column);
            }
            for value in &observation.requires_values {
                add_unique(&mut values, value);
            }
            if let ObservationKind::Concatenating { included_columns } = &observation.kind {
                for column in included_columns {
                    add_unique(&mut columns, column);
                }
            }
            for name in &observation.resolved_stratifications {
                let stratification = &self.stratifications[name];
                for column in &stratification.requires_columns {
                    add_unique(&mut columns, column);
                }
                for value in &stratification.requires_values {
                    add_unique(&mut values, value);
                }
            }
        }

        let tracked = sim.population.tracked_subset(&event.index);
        let mut frame = sim.population.table().frame(&tracked, &columns)?;

        let event_time = event.time + event.step_size;
        frame.push_series(Series::broadcast(
            "current_time",
            frame.index.clone(),
            Value::Time(event.time),
        ))?;
        frame.push_series(Series::broadcast(
            "event_time",
            frame.index.clone(),
            Value::Time(event_time),
        ))?;
        frame.push_series(Series::broadcast(
            "event_step_size",
            frame.index.clone(),
            delta_value(event.step_size),
        ))?;
        for (key, value) in &event.user_data {
            frame.push_series(Series::broadcast(key, frame.index.clone(), value.clone()))?;
        }
        for name in values {
            let series = sim.values.compute(sim, &name, &frame.index)?;
            frame.push_column(name, series.values)?;
        }
        Ok(frame)
    }
}

fn is_synthetic(name: &str) -> bool {
    matches!(name, "current_time" | "event_time" | "event_step_size")
}

fn delta_value(delta: crate::clock::SimDelta) -> Value {
    match delta {
        crate::clock::SimDelta::Ticks(t) => Value::Int(t),
        crate::clock::SimDelta::Span(d) => Value::Float(d.to_unit(hifitime::Unit::Day)),
    }
}
