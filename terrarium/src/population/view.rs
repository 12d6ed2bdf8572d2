//! Mediated read/write access to the state table.
//!
//! A view can read any columns it names, but can only write columns whose
//! creator is the component the view belongs to. Writes never create rows;
//! during initial population creation they must cover every new row.

use super::manager::PopulationManager;
use super::query::Query;
use super::table::{Frame, PopulationError, Series, SimIndex};

/// A read/write handle onto a subset of the state table's columns, scoped to
/// one owning component. Obtained from the builder during setup.
#[derive(Debug, Clone)]
pub struct PopulationView {
    pub(crate) id: usize,
    /// The owning component's name; `None` makes the view read-only.
    pub(crate) component: Option<String>,
    /// Columns this view reads. Empty means all columns.
    pub(crate) columns: Vec<String>,
    pub(crate) default_query: Query,
}

/// A population update: one series or a frame of creator-owned columns.
#[derive(Debug, Clone)]
pub enum PopulationUpdate {
    Series(Series),
    Frame(Frame),
}

impl From<Series> for PopulationUpdate {
    fn from(series: Series) -> Self {
        PopulationUpdate::Series(series)
    }
}

impl From<Frame> for PopulationUpdate {
    fn from(frame: Frame) -> Self {
        PopulationUpdate::Frame(frame)
    }
}

impl PopulationView {
    pub fn name(&self) -> String {
        format!("population_view_{}", self.id)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The columns this view may write: those created by its component.
    pub fn private_columns(&self, population: &PopulationManager) -> Vec<String> {
        match &self.component {
            Some(component) => population.columns_created_by(component),
            None => Vec::new(),
        }
    }

    /// The view's columns for `index`, filtered by the conjunction of
    /// `query`, the view's default query, and `tracked == true`.
    pub fn get(
        &self,
        population: &PopulationManager,
        index: &SimIndex,
        query: &str,
    ) -> Result<Frame, PopulationError> {
        self.get_with(population, index, query, true)
    }

    /// Like [`get`](Self::get), but keeping untracked simulants.
    pub fn get_including_untracked(
        &self,
        population: &PopulationManager,
        index: &SimIndex,
        query: &str,
    ) -> Result<Frame, PopulationError> {
        self.get_with(population, index, query, false)
    }

    fn get_with(
        &self,
        population: &PopulationManager,
        index: &SimIndex,
        query: &str,
        exclude_untracked: bool,
    ) -> Result<Frame, PopulationError> {
        let filtered = self.get_filtered_index(population, index, query, exclude_untracked)?;
        population.table().frame(&filtered, &self.columns)
    }

    /// The subset of `index` surviving this view's filters, without
    /// materialising any columns.
    pub fn get_filtered_index(
        &self,
        population: &PopulationManager,
        index: &SimIndex,
        query: &str,
        exclude_untracked: bool,
    ) -> Result<SimIndex, PopulationError> {
        let mut combined = Query::parse(query)?.and(self.default_query.clone());
        if exclude_untracked {
            combined = combined.and(Query::equals(super::table::TRACKED_COLUMN, true));
        }
        population.table().filter_index(index, &combined)
    }

    /// Write new values for creator-owned columns.
    ///
    /// The update must be a series or frame whose columns this view's
    /// component created, whose index is a subset of the table index, and
    /// whose dtypes match the existing columns. During initial population
    /// creation the update must cover every new row, and unseen columns are
    /// created with the update's dtype; at any other time a column that was
    /// never created is an error.
    pub fn update(
        &self,
        population: &mut PopulationManager,
        update: impl Into<PopulationUpdate>,
    ) -> Result<(), PopulationError> {
        let Some(component) = self.component.clone() else {
            return Err(PopulationError::ReadOnlyView);
        };
        let private = population.columns_created_by(&component);
        let series_list = coerce_update(update.into(), &private)?;

        let table_len = population.table().len();
        for series in &series_list {
            let unknown = series.index.iter().filter(|&&row| row >= table_len).count();
            if unknown > 0 {
                return Err(PopulationError::UnknownIndex { count: unknown });
            }
        }

        if population.creating_initial_population() {
            let covered: std::collections::HashSet<usize> = series_list
                .iter()
                .flat_map(|s| s.index.iter().copied())
                .collect();
            let missing = population
                .creation_index()
                .iter()
                .filter(|row| !covered.contains(row))
                .count();
            if missing > 0 {
                return Err(PopulationError::IncompleteInitialization {
                    component,
                    missing,
                });
            }
        }

        for series in series_list {
            let exists = population.table().has_column(&series.name);
            if exists {
                population.table_mut().write(&series)?;
            } else if population.creating_initial_population() {
                population.table_mut().add_column(&component, &series)?;
            } else {
                return Err(PopulationError::NeverCreated {
                    column: series.name,
                });
            }
        }
        Ok(())
    }
}

/// Normalise an update to a list of series and check the column-ownership
/// preconditions.
fn coerce_update(
    update: PopulationUpdate,
    private: &[String],
) -> Result<Vec<Series>, PopulationError> {
    let series_list = match update {
        PopulationUpdate::Series(mut series) => {
            if series.name.is_empty() {
                if private.len() == 1 {
                    series.name = private[0].clone();
                } else {
                    return Err(PopulationError::AmbiguousSeries);
                }
            } else if !private.contains(&series.name) && private.len() == 1 {
                series.name = private[0].clone();
            }
            vec![series]
        }
        PopulationUpdate::Frame(frame) => {
            let names: Vec<String> = frame.column_names().map(str::to_string).collect();
            names
                .iter()
                .map(|name| frame.series(name))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if series_list.is_empty() {
        return Err(PopulationError::EmptyUpdate);
    }
    let stray: Vec<String> = series_list
        .iter()
        .map(|s| s.name.clone())
        .filter(|name| !private.contains(name))
        .collect();
    if !stray.is_empty() {
        return Err(PopulationError::NotOwnedColumns(stray));
    }
    Ok(series_list)
}
