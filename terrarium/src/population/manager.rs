//! Ownership and lifecycle of the state table.

use super::query::Query;
use super::table::{PopulationError, Series, SimIndex, StateTable, Value};
use super::view::PopulationView;
use crate::clock::{SimDelta, SimTime};
use crate::component::ComponentId;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// The engine-internal owner of the `tracked` column.
pub const POPULATION_MANAGER_NAME: &str = "population_manager";
/// The engine-internal owner of the per-simulant scheduling columns.
pub const TIME_MANAGER_NAME: &str = "time_manager";

/// Who runs a registered simulant initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializerId {
    Component(ComponentId),
    /// The engine's per-simulant scheduling columns.
    Scheduling,
}

/// Data handed to every simulant initializer when simulants are created.
#[derive(Debug, Clone)]
pub struct SimulantData {
    /// The new simulants being added to the simulation.
    pub index: SimIndex,
    /// Extra data passed in by whoever requested the creation.
    pub user_data: HashMap<String, Value>,
    /// The time when the simulants enter the simulation.
    pub creation_time: SimTime,
    /// The span over which the simulants are created. Useful for, e.g.,
    /// distributing entrance times over the window.
    pub creation_window: SimDelta,
}

#[derive(Debug, Clone)]
struct RegisteredInitializer {
    id: InitializerId,
    component: String,
    columns: Vec<String>,
}

/// Owns the state table, the column-creator registry, and the set of
/// simulant initializers. All mutation of the table flows through
/// [`PopulationView::update`] or the engine-internal writers here.
#[derive(Debug)]
pub struct PopulationManager {
    table: StateTable,
    initializers: Vec<RegisteredInitializer>,
    /// column name -> creating component name
    creators: HashMap<String, String>,
    creating_initial_population: bool,
    adding_simulants: bool,
    creation_index: SimIndex,
    view_counter: usize,
    creation_queue: VecDeque<(usize, HashMap<String, Value>)>,
}

impl Default for PopulationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PopulationManager {
    pub fn new() -> Self {
        let mut manager = PopulationManager {
            table: StateTable::new(POPULATION_MANAGER_NAME),
            initializers: Vec::new(),
            creators: HashMap::new(),
            creating_initial_population: false,
            adding_simulants: false,
            creation_index: SimIndex::empty(),
            view_counter: 0,
            creation_queue: VecDeque::new(),
        };
        manager.creators.insert(
            super::table::TRACKED_COLUMN.to_string(),
            POPULATION_MANAGER_NAME.to_string(),
        );
        manager
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut StateTable {
        &mut self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn full_index(&self) -> SimIndex {
        self.table.full_index()
    }

    /// The component that created a column, if it exists.
    pub fn column_creator(&self, column: &str) -> Option<&str> {
        self.creators.get(column).map(String::as_str)
    }

    pub fn columns_created_by(&self, component: &str) -> Vec<String> {
        let mut columns: Vec<String> = self
            .creators
            .iter()
            .filter(|(_, creator)| creator.as_str() == component)
            .map(|(column, _)| column.clone())
            .collect();
        columns.sort();
        columns
    }

    /// Register a simulant initializer: one per component, and exactly one
    /// creator per column.
    pub(crate) fn register_initializer(
        &mut self,
        id: InitializerId,
        component: &str,
        columns: &[String],
    ) -> Result<(), PopulationError> {
        if self.initializers.iter().any(|i| i.component == component) {
            return Err(PopulationError::MultipleInitializers {
                component: component.to_string(),
            });
        }
        for column in columns {
            if let Some(first) = self.creators.get(column) {
                return Err(PopulationError::ColumnInitializedTwice {
                    column: column.clone(),
                    first: first.clone(),
                    second: component.to_string(),
                });
            }
        }
        for column in columns {
            self.creators
                .insert(column.clone(), component.to_string());
        }
        debug!(component, ?columns, "registered simulant initializer");
        self.initializers.push(RegisteredInitializer {
            id,
            component: component.to_string(),
            columns: columns.to_vec(),
        });
        Ok(())
    }

    pub(crate) fn get_view(
        &mut self,
        component: Option<String>,
        columns: Vec<String>,
        default_query: Query,
    ) -> PopulationView {
        let id = self.view_counter;
        self.view_counter += 1;
        PopulationView {
            id,
            component,
            columns,
            default_query,
        }
    }

    /// Mark simulants as untracked. They stay in the table but disappear
    /// from default view reads.
    pub fn set_untracked(&mut self, index: &SimIndex) {
        self.table
            .set_bool(super::table::TRACKED_COLUMN, index, false);
    }

    /// Rows of `index` that are still tracked.
    pub fn tracked_subset(&self, index: &SimIndex) -> SimIndex {
        self.table.tracked_subset(index)
    }

    /// Ask the engine to create simulants after the current dispatch
    /// completes. Usable from any event hook.
    pub fn queue_simulants(&mut self, count: usize, user_data: HashMap<String, Value>) {
        self.creation_queue.push_back((count, user_data));
    }

    pub(crate) fn take_queued_creation(&mut self) -> Option<(usize, HashMap<String, Value>)> {
        self.creation_queue.pop_front()
    }

    pub(crate) fn begin_creation(&mut self, count: usize, initial: bool) -> SimIndex {
        let index = self.table.grow(count);
        self.creating_initial_population = initial;
        self.adding_simulants = true;
        self.creation_index = index.clone();
        index
    }

    pub(crate) fn end_creation(&mut self) {
        self.creating_initial_population = false;
        self.adding_simulants = false;
        self.creation_index = SimIndex::empty();
    }

    pub fn creating_initial_population(&self) -> bool {
        self.creating_initial_population
    }

    pub fn adding_simulants(&self) -> bool {
        self.adding_simulants
    }

    pub(crate) fn creation_index(&self) -> &SimIndex {
        &self.creation_index
    }

    /// Engine-owned column write path (scheduling columns, tracked). Creates
    /// the column on first write.
    pub(crate) fn write_engine_column(
        &mut self,
        creator: &str,
        series: &Series,
    ) -> Result<(), PopulationError> {
        if self.table.has_column(&series.name) {
            self.table.write(series)
        } else {
            self.creators
                .insert(series.name.clone(), creator.to_string());
            self.table.add_column(creator, series)
        }
    }
}
