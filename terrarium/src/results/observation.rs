//! Observations: registered measures gathered on a tick phase.

use crate::event::TickPhase;
use crate::population::Frame;
use indexmap::IndexMap;

/// Aggregates a (stratum of a) prepared population frame to one number.
pub type AggregatorFn = Box<dyn Fn(&Frame) -> anyhow::Result<f64>>;
/// Gathers one scalar per step from the filtered population.
pub type GathererFn = Box<dyn Fn(&Frame) -> anyhow::Result<f64>>;
/// Receives the accumulated results at report time in place of the default
/// CSV writer.
pub type ReporterFn = Box<dyn FnMut(&str, &ObservationResults) -> anyhow::Result<()>>;

/// Common aggregation methods.
pub mod aggregators {
    use super::AggregatorFn;
    use crate::population::{Frame, SeriesValues};

    pub fn count() -> AggregatorFn {
        Box::new(|frame: &Frame| Ok(frame.len() as f64))
    }

    fn column_sum(frame: &Frame, column: &str) -> anyhow::Result<f64> {
        match frame.column(column) {
            Some(SeriesValues::Float(values)) => Ok(values.iter().sum()),
            Some(SeriesValues::Int(values)) => Ok(values.iter().sum::<i64>() as f64),
            Some(other) => anyhow::bail!(
                "aggregator source '{column}' must be numeric, got {}",
                other.dtype()
            ),
            None => anyhow::bail!("aggregator source '{column}' is not in the prepared population"),
        }
    }

    pub fn sum(column: &str) -> AggregatorFn {
        let column = column.to_string();
        Box::new(move |frame: &Frame| column_sum(frame, &column))
    }

    pub fn mean(column: &str) -> AggregatorFn {
        let column = column.to_string();
        Box::new(move |frame: &Frame| {
            if frame.is_empty() {
                return Ok(0.0);
            }
            Ok(column_sum(frame, &column)? / frame.len() as f64)
        })
    }
}

/// A stratified accumulator: one float cell per combination of categories.
#[derive(Debug, Clone, Default)]
pub struct StratifiedTable {
    pub stratifications: Vec<String>,
    pub cells: IndexMap<Vec<String>, f64>,
}

impl StratifiedTable {
    /// Zero-filled Cartesian product of the given category sets.
    pub(crate) fn zeros(stratifications: Vec<String>, category_sets: &[Vec<String>]) -> Self {
        let mut cells = IndexMap::new();
        let mut keys = vec![Vec::new()];
        for categories in category_sets {
            let mut next = Vec::with_capacity(keys.len() * categories.len());
            for key in &keys {
                for category in categories {
                    let mut grown: Vec<String> = key.clone();
                    grown.push(category.clone());
                    next.push(grown);
                }
            }
            keys = next;
        }
        for key in keys {
            cells.insert(key, 0.0);
        }
        StratifiedTable {
            stratifications,
            cells,
        }
    }

    pub fn get(&self, key: &[&str]) -> Option<f64> {
        let key: Vec<String> = key.iter().map(|s| s.to_string()).collect();
        self.cells.get(&key).copied()
    }

    pub fn total(&self) -> f64 {
        self.cells.values().sum()
    }

    pub(crate) fn add(&mut self, key: Vec<String>, value: f64) {
        *self.cells.entry(key).or_insert(0.0) += value;
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for name in &self.stratifications {
            out.push_str(name);
            out.push(',');
        }
        out.push_str("value\n");
        for (key, value) in &self.cells {
            for part in key {
                out.push_str(part);
                out.push(',');
            }
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

/// A row-append accumulator for concatenating observations.
#[derive(Debug, Clone, Default)]
pub struct RowTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RowTable {
    pub fn to_csv(&self) -> String {
        let mut out = self.header.join(",");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }
}

/// The accumulated state of one observation, as seen at report time.
#[derive(Debug, Clone)]
pub enum ObservationResults {
    Stratified(StratifiedTable),
    Rows(RowTable),
    /// One `(time, value)` pair per step.
    Scalars(Vec<(String, f64)>),
}

impl ObservationResults {
    pub fn to_csv(&self) -> String {
        match self {
            ObservationResults::Stratified(table) => table.to_csv(),
            ObservationResults::Rows(table) => table.to_csv(),
            ObservationResults::Scalars(values) => {
                let mut out = String::from("time,value\n");
                for (time, value) in values {
                    out.push_str(&format!("{time},{value}\n"));
                }
                out
            }
        }
    }
}

pub(crate) enum ObservationKind {
    Adding { aggregator: AggregatorFn },
    Concatenating { included_columns: Vec<String> },
    Unstratified { gatherer: GathererFn },
}

pub(crate) struct Observation {
    pub name: String,
    pub pop_filter: crate::population::Query,
    pub when: TickPhase,
    pub requires_columns: Vec<String>,
    pub requires_values: Vec<String>,
    pub additional_stratifications: Vec<String>,
    pub excluded_stratifications: Vec<String>,
    pub kind: ObservationKind,
    /// Stratification names in effect, resolved after setup.
    pub resolved_stratifications: Vec<String>,
    pub results: ObservationResults,
    pub reporter: Option<ReporterFn>,
}

/// Registration parameters for an adding observation: aggregate each
/// stratum every matching phase and add the result into a running table.
pub struct AddingObservation {
    pub name: String,
    pub pop_filter: String,
    pub aggregator: AggregatorFn,
    pub requires_columns: Vec<String>,
    pub requires_values: Vec<String>,
    pub additional_stratifications: Vec<String>,
    pub excluded_stratifications: Vec<String>,
    pub when: TickPhase,
    pub reporter: Option<ReporterFn>,
}

impl AddingObservation {
    pub fn new(name: &str, aggregator: AggregatorFn) -> Self {
        AddingObservation {
            name: name.to_string(),
            pop_filter: String::new(),
            aggregator,
            requires_columns: Vec::new(),
            requires_values: Vec::new(),
            additional_stratifications: Vec::new(),
            excluded_stratifications: Vec::new(),
            when: TickPhase::default(),
            reporter: None,
        }
    }

    pub fn with_pop_filter(mut self, filter: &str) -> Self {
        self.pop_filter = filter.to_string();
        self
    }

    pub fn with_requires_columns(mut self, columns: &[&str]) -> Self {
        self.requires_columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_requires_values(mut self, values: &[&str]) -> Self {
        self.requires_values = values.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_additional_stratifications(mut self, names: &[&str]) -> Self {
        self.additional_stratifications = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_excluded_stratifications(mut self, names: &[&str]) -> Self {
        self.excluded_stratifications = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on(mut self, when: TickPhase) -> Self {
        self.when = when;
        self
    }

    pub fn with_reporter(mut self, reporter: ReporterFn) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

/// Registration parameters for a concatenating observation: append the
/// filtered rows to a growing table every matching phase.
pub struct ConcatenatingObservation {
    pub name: String,
    pub pop_filter: String,
    pub included_columns: Vec<String>,
    pub when: TickPhase,
    pub reporter: Option<ReporterFn>,
}

impl ConcatenatingObservation {
    pub fn new(name: &str, included_columns: &[&str]) -> Self {
        ConcatenatingObservation {
            name: name.to_string(),
            pop_filter: String::new(),
            included_columns: included_columns.iter().map(|s| s.to_string()).collect(),
            when: TickPhase::default(),
            reporter: None,
        }
    }

    pub fn with_pop_filter(mut self, filter: &str) -> Self {
        self.pop_filter = filter.to_string();
        self
    }

    pub fn on(mut self, when: TickPhase) -> Self {
        self.when = when;
        self
    }

    pub fn with_reporter(mut self, reporter: ReporterFn) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

/// Registration parameters for an unstratified observation: one scalar per
/// matching phase.
pub struct UnstratifiedObservation {
    pub name: String,
    pub pop_filter: String,
    pub gatherer: GathererFn,
    pub requires_columns: Vec<String>,
    pub requires_values: Vec<String>,
    pub when: TickPhase,
    pub reporter: Option<ReporterFn>,
}

impl UnstratifiedObservation {
    pub fn new(name: &str, gatherer: GathererFn) -> Self {
        UnstratifiedObservation {
            name: name.to_string(),
            pop_filter: String::new(),
            gatherer,
            requires_columns: Vec::new(),
            requires_values: Vec::new(),
            when: TickPhase::default(),
            reporter: None,
        }
    }

    pub fn with_pop_filter(mut self, filter: &str) -> Self {
        self.pop_filter = filter.to_string();
        self
    }

    pub fn with_requires_columns(mut self, columns: &[&str]) -> Self {
        self.requires_columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_requires_values(mut self, values: &[&str]) -> Self {
        self.requires_values = values.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on(mut self, when: TickPhase) -> Self {
        self.when = when;
        self
    }

    pub fn with_reporter(mut self, reporter: ReporterFn) -> Self {
        self.reporter = Some(reporter);
        self
    }
}
