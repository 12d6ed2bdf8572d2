//! The population management system: the state table, mediated views, and
//! simulant creation.

pub mod manager;
pub mod query;
pub mod table;
pub mod view;

pub use manager::{
    InitializerId, PopulationManager, SimulantData, POPULATION_MANAGER_NAME, TIME_MANAGER_NAME,
};
pub use query::Query;
pub use table::{
    Column, DType, Frame, PopulationError, Series, SeriesValues, SimIndex, StateTable, Value,
    TRACKED_COLUMN,
};
pub use view::{PopulationUpdate, PopulationView};
