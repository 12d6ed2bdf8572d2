//! The state table and its building blocks.
//!
//! The table is columnar: a dense integer row index (one row per simulant)
//! and a set of typed columns. Each column's element type is fixed when the
//! column is created; cells are nullable only in the window between row
//! allocation and initialization. Reads hand out dense [`Series`] and
//! [`Frame`] values, never references into the table.

use crate::clock::SimTime;
use derive_more::{Deref, DerefMut};
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("requested columns are not in the population table: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("{count} rows in the update are not part of the population table")]
    UnknownIndex { count: usize },
    #[error("this view is read-only and cannot update the population")]
    ReadOnlyView,
    #[error("cannot update with an unnamed series unless the view owns exactly one column")]
    AmbiguousSeries,
    #[error("the update contains columns not owned by this view's component: {0:?}")]
    NotOwnedColumns(Vec<String>),
    #[error("the update contains no columns")]
    EmptyUpdate,
    #[error(
        "components must initialize all new simulants; '{component}' left {missing} rows of the new population uninitialized"
    )]
    IncompleteInitialization { component: String, missing: usize },
    #[error("column '{column}' was never created during population initialization and cannot be updated now")]
    NeverCreated { column: String },
    #[error("update would change the dtype of column '{column}' from {expected} to {found}")]
    DtypeMismatch {
        column: String,
        expected: DType,
        found: DType,
    },
    #[error("column '{column}' holds no value for simulant {simulant}")]
    UninitializedRead { column: String, simulant: usize },
    #[error("simulant {simulant} is not part of the population table")]
    UnknownSimulant { simulant: usize },
    #[error("component '{component}' has multiple population initializers")]
    MultipleInitializers { component: String },
    #[error("components '{first}' and '{second}' both register initializers for column '{column}'")]
    ColumnInitializedTwice {
        column: String,
        first: String,
        second: String,
    },
    #[error("invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
    #[error("series '{name}' has {values} values for {rows} index rows")]
    LengthMismatch {
        name: String,
        values: usize,
        rows: usize,
    },
}

/// A set of simulant identifiers (row ids), in a defined order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut)]
pub struct SimIndex(pub Vec<usize>);

impl SimIndex {
    pub fn new(ids: Vec<usize>) -> Self {
        SimIndex(ids)
    }

    pub fn from_range(range: std::ops::Range<usize>) -> Self {
        SimIndex(range.collect())
    }

    pub fn empty() -> Self {
        SimIndex(Vec::new())
    }
}

impl FromIterator<usize> for SimIndex {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        SimIndex(iter.into_iter().collect())
    }
}

/// The element type of a column, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Bool,
    Int,
    Float,
    Str,
    Time,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int => "int",
            DType::Float => "float",
            DType::Str => "str",
            DType::Time => "time",
        };
        write!(f, "{name}")
    }
}

/// One cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(SimTime),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::Bool(_) => DType::Bool,
            Value::Int(_) => DType::Int,
            Value::Float(_) => DType::Float,
            Value::Str(_) => DType::Str,
            Value::Time(_) => DType::Time,
        }
    }

    /// Numeric comparison crosses the int/float divide; everything else
    /// compares only within its own type.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.partial_cmp(b),
            (Int(a), Int(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Str(a), Str(b)) => a.partial_cmp(b),
            (Time(a), Time(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Time(t) => write!(f, "{t}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<SimTime> for Value {
    fn from(v: SimTime) -> Self {
        Value::Time(v)
    }
}

/// Dense, non-null column data for a [`Series`] or [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValues {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
    Time(Vec<SimTime>),
}

impl SeriesValues {
    pub fn len(&self) -> usize {
        match self {
            SeriesValues::Bool(v) => v.len(),
            SeriesValues::Int(v) => v.len(),
            SeriesValues::Float(v) => v.len(),
            SeriesValues::Str(v) => v.len(),
            SeriesValues::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            SeriesValues::Bool(_) => DType::Bool,
            SeriesValues::Int(_) => DType::Int,
            SeriesValues::Float(_) => DType::Float,
            SeriesValues::Str(_) => DType::Str,
            SeriesValues::Time(_) => DType::Time,
        }
    }

    pub fn get(&self, pos: usize) -> Value {
        match self {
            SeriesValues::Bool(v) => Value::Bool(v[pos]),
            SeriesValues::Int(v) => Value::Int(v[pos]),
            SeriesValues::Float(v) => Value::Float(v[pos]),
            SeriesValues::Str(v) => Value::Str(v[pos].clone()),
            SeriesValues::Time(v) => Value::Time(v[pos]),
        }
    }

    fn empty_of(dtype: DType) -> SeriesValues {
        match dtype {
            DType::Bool => SeriesValues::Bool(Vec::new()),
            DType::Int => SeriesValues::Int(Vec::new()),
            DType::Float => SeriesValues::Float(Vec::new()),
            DType::Str => SeriesValues::Str(Vec::new()),
            DType::Time => SeriesValues::Time(Vec::new()),
        }
    }

    fn push(&mut self, value: Value) {
        match (self, value) {
            (SeriesValues::Bool(v), Value::Bool(x)) => v.push(x),
            (SeriesValues::Int(v), Value::Int(x)) => v.push(x),
            (SeriesValues::Float(v), Value::Float(x)) => v.push(x),
            (SeriesValues::Str(v), Value::Str(x)) => v.push(x),
            (SeriesValues::Time(v), Value::Time(x)) => v.push(x),
            _ => unreachable!("push checked by caller"),
        }
    }

    /// Subset by positional row selection.
    pub fn take(&self, positions: &[usize]) -> SeriesValues {
        match self {
            SeriesValues::Bool(v) => SeriesValues::Bool(positions.iter().map(|&p| v[p]).collect()),
            SeriesValues::Int(v) => SeriesValues::Int(positions.iter().map(|&p| v[p]).collect()),
            SeriesValues::Float(v) => {
                SeriesValues::Float(positions.iter().map(|&p| v[p]).collect())
            }
            SeriesValues::Str(v) => {
                SeriesValues::Str(positions.iter().map(|&p| v[p].clone()).collect())
            }
            SeriesValues::Time(v) => SeriesValues::Time(positions.iter().map(|&p| v[p]).collect()),
        }
    }
}

/// A named, index-aligned column of dense values.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub index: SimIndex,
    pub values: SeriesValues,
}

impl Series {
    pub fn new(
        name: impl Into<String>,
        index: SimIndex,
        values: SeriesValues,
    ) -> Result<Self, PopulationError> {
        let name = name.into();
        if index.len() != values.len() {
            return Err(PopulationError::LengthMismatch {
                name,
                values: values.len(),
                rows: index.len(),
            });
        }
        Ok(Series {
            name,
            index,
            values,
        })
    }

    pub fn floats(name: impl Into<String>, index: SimIndex, values: Vec<f64>) -> Self {
        Series::new(name, index, SeriesValues::Float(values)).expect("aligned float series")
    }

    pub fn ints(name: impl Into<String>, index: SimIndex, values: Vec<i64>) -> Self {
        Series::new(name, index, SeriesValues::Int(values)).expect("aligned int series")
    }

    pub fn bools(name: impl Into<String>, index: SimIndex, values: Vec<bool>) -> Self {
        Series::new(name, index, SeriesValues::Bool(values)).expect("aligned bool series")
    }

    pub fn strs(name: impl Into<String>, index: SimIndex, values: Vec<String>) -> Self {
        Series::new(name, index, SeriesValues::Str(values)).expect("aligned str series")
    }

    pub fn times(name: impl Into<String>, index: SimIndex, values: Vec<SimTime>) -> Self {
        Series::new(name, index, SeriesValues::Time(values)).expect("aligned time series")
    }

    /// The same value for every row of the index.
    pub fn broadcast(name: impl Into<String>, index: SimIndex, value: Value) -> Self {
        let n = index.len();
        let values = match value {
            Value::Bool(x) => SeriesValues::Bool(vec![x; n]),
            Value::Int(x) => SeriesValues::Int(vec![x; n]),
            Value::Float(x) => SeriesValues::Float(vec![x; n]),
            Value::Str(x) => SeriesValues::Str(vec![x; n]),
            Value::Time(x) => SeriesValues::Time(vec![x; n]),
        };
        Series {
            name: name.into(),
            index,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Dense float access; errors for non-float series.
    pub fn as_floats(&self) -> Result<&[f64], PopulationError> {
        match &self.values {
            SeriesValues::Float(v) => Ok(v),
            other => Err(PopulationError::DtypeMismatch {
                column: self.name.clone(),
                expected: DType::Float,
                found: other.dtype(),
            }),
        }
    }

    pub fn as_strs(&self) -> Result<&[String], PopulationError> {
        match &self.values {
            SeriesValues::Str(v) => Ok(v),
            other => Err(PopulationError::DtypeMismatch {
                column: self.name.clone(),
                expected: DType::Str,
                found: other.dtype(),
            }),
        }
    }
}

/// A dense, index-aligned collection of columns.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub index: SimIndex,
    columns: IndexMap<String, SeriesValues>,
}

impl Frame {
    pub fn new(index: SimIndex) -> Self {
        Frame {
            index,
            columns: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        values: SeriesValues,
    ) -> Result<(), PopulationError> {
        let name = name.into();
        if values.len() != self.index.len() {
            return Err(PopulationError::LengthMismatch {
                name,
                values: values.len(),
                rows: self.index.len(),
            });
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn push_series(&mut self, series: Series) -> Result<(), PopulationError> {
        self.push_column(series.name, series.values)
    }

    pub fn column(&self, name: &str) -> Option<&SeriesValues> {
        self.columns.get(name)
    }

    pub fn series(&self, name: &str) -> Result<Series, PopulationError> {
        let values = self
            .columns
            .get(name)
            .ok_or_else(|| PopulationError::MissingColumns(vec![name.to_string()]))?;
        Ok(Series {
            name: name.to_string(),
            index: self.index.clone(),
            values: values.clone(),
        })
    }

    /// The value at a row position (not a simulant id) in a named column.
    pub fn cell(&self, pos: usize, name: &str) -> Option<Value> {
        self.columns.get(name).map(|values| values.get(pos))
    }

    /// A new frame holding the given row positions, all columns.
    pub fn take_rows(&self, positions: &[usize]) -> Frame {
        let index = SimIndex(positions.iter().map(|&p| self.index[p]).collect());
        let mut out = Frame::new(index);
        for (name, values) in &self.columns {
            out.columns.insert(name.clone(), values.take(positions));
        }
        out
    }
}

/// One owned column of the state table. Cells are null only between row
/// allocation and initialization.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub creator: String,
    values: ColumnValues,
}

#[derive(Debug, Clone)]
enum ColumnValues {
    Bool(Vec<Option<bool>>),
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
    Time(Vec<Option<SimTime>>),
}

impl Column {
    fn new_null(name: String, creator: String, dtype: DType, len: usize) -> Self {
        let values = match dtype {
            DType::Bool => ColumnValues::Bool(vec![None; len]),
            DType::Int => ColumnValues::Int(vec![None; len]),
            DType::Float => ColumnValues::Float(vec![None; len]),
            DType::Str => ColumnValues::Str(vec![None; len]),
            DType::Time => ColumnValues::Time(vec![None; len]),
        };
        Column {
            name,
            creator,
            values,
        }
    }

    pub fn dtype(&self) -> DType {
        match &self.values {
            ColumnValues::Bool(_) => DType::Bool,
            ColumnValues::Int(_) => DType::Int,
            ColumnValues::Float(_) => DType::Float,
            ColumnValues::Str(_) => DType::Str,
            ColumnValues::Time(_) => DType::Time,
        }
    }

    fn len(&self) -> usize {
        match &self.values {
            ColumnValues::Bool(v) => v.len(),
            ColumnValues::Int(v) => v.len(),
            ColumnValues::Float(v) => v.len(),
            ColumnValues::Str(v) => v.len(),
            ColumnValues::Time(v) => v.len(),
        }
    }

    fn push_null(&mut self) {
        match &mut self.values {
            ColumnValues::Bool(v) => v.push(None),
            ColumnValues::Int(v) => v.push(None),
            ColumnValues::Float(v) => v.push(None),
            ColumnValues::Str(v) => v.push(None),
            ColumnValues::Time(v) => v.push(None),
        }
    }

    pub fn get(&self, row: usize) -> Option<Value> {
        match &self.values {
            ColumnValues::Bool(v) => v[row].map(Value::Bool),
            ColumnValues::Int(v) => v[row].map(Value::Int),
            ColumnValues::Float(v) => v[row].map(Value::Float),
            ColumnValues::Str(v) => v[row].clone().map(Value::Str),
            ColumnValues::Time(v) => v[row].map(Value::Time),
        }
    }

    fn set(&mut self, row: usize, value: Value) -> Result<(), PopulationError> {
        match (&mut self.values, value) {
            (ColumnValues::Bool(v), Value::Bool(x)) => v[row] = Some(x),
            (ColumnValues::Int(v), Value::Int(x)) => v[row] = Some(x),
            (ColumnValues::Float(v), Value::Float(x)) => v[row] = Some(x),
            (ColumnValues::Str(v), Value::Str(x)) => v[row] = Some(x),
            (ColumnValues::Time(v), Value::Time(x)) => v[row] = Some(x),
            (values, value) => {
                return Err(PopulationError::DtypeMismatch {
                    column: self.name.clone(),
                    expected: match values {
                        ColumnValues::Bool(_) => DType::Bool,
                        ColumnValues::Int(_) => DType::Int,
                        ColumnValues::Float(_) => DType::Float,
                        ColumnValues::Str(_) => DType::Str,
                        ColumnValues::Time(_) => DType::Time,
                    },
                    found: value.dtype(),
                });
            }
        }
        Ok(())
    }
}

/// The population state table.
#[derive(Debug, Default)]
pub struct StateTable {
    rows: usize,
    columns: IndexMap<String, Column>,
}

pub const TRACKED_COLUMN: &str = "tracked";

impl StateTable {
    pub fn new(tracked_creator: &str) -> Self {
        let mut columns = IndexMap::new();
        columns.insert(
            TRACKED_COLUMN.to_string(),
            Column::new_null(
                TRACKED_COLUMN.to_string(),
                tracked_creator.to_string(),
                DType::Bool,
                0,
            ),
        );
        StateTable { rows: 0, columns }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn full_index(&self) -> SimIndex {
        SimIndex::from_range(0..self.rows)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Allocate `count` new rows, null everywhere except `tracked`, which
    /// starts `true`. Returns the new contiguous index.
    pub fn grow(&mut self, count: usize) -> SimIndex {
        let start = self.rows;
        self.rows += count;
        for column in self.columns.values_mut() {
            if column.name == TRACKED_COLUMN {
                if let ColumnValues::Bool(v) = &mut column.values {
                    v.extend(std::iter::repeat_n(Some(true), count));
                }
            } else {
                for _ in 0..count {
                    column.push_null();
                }
            }
        }
        SimIndex::from_range(start..self.rows)
    }

    /// Create a column from its first update. The dtype is fixed from the
    /// series; rows outside the update stay null.
    pub fn add_column(
        &mut self,
        creator: &str,
        series: &Series,
    ) -> Result<(), PopulationError> {
        let mut column = Column::new_null(
            series.name.clone(),
            creator.to_string(),
            series.dtype(),
            self.rows,
        );
        for (pos, &row) in series.index.iter().enumerate() {
            if row >= self.rows {
                return Err(PopulationError::UnknownIndex { count: 1 });
            }
            column.set(row, series.values.get(pos))?;
        }
        self.columns.insert(series.name.clone(), column);
        Ok(())
    }

    /// Write an aligned series into an existing column.
    pub fn write(&mut self, series: &Series) -> Result<(), PopulationError> {
        let column = self
            .columns
            .get_mut(&series.name)
            .ok_or_else(|| PopulationError::MissingColumns(vec![series.name.clone()]))?;
        if column.dtype() != series.dtype() {
            return Err(PopulationError::DtypeMismatch {
                column: series.name.clone(),
                expected: column.dtype(),
                found: series.dtype(),
            });
        }
        for (pos, &row) in series.index.iter().enumerate() {
            if row >= self.rows {
                return Err(PopulationError::UnknownIndex { count: 1 });
            }
            column.set(row, series.values.get(pos))?;
        }
        Ok(())
    }

    pub fn set_bool(&mut self, name: &str, index: &SimIndex, value: bool) {
        if let Some(column) = self.columns.get_mut(name) {
            if let ColumnValues::Bool(v) = &mut column.values {
                for &row in index.iter() {
                    v[row] = Some(value);
                }
            }
        }
    }

    /// Materialise a dense frame of the named columns (all columns if the
    /// slice is empty) for the given rows. Null cells are an error.
    pub fn frame(&self, index: &SimIndex, columns: &[String]) -> Result<Frame, PopulationError> {
        let names: Vec<String> = if columns.is_empty() {
            self.columns.keys().cloned().collect()
        } else {
            columns.to_vec()
        };
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !self.columns.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PopulationError::MissingColumns(missing));
        }
        let mut frame = Frame::new(index.clone());
        for name in names {
            let column = &self.columns[&name];
            let mut values = SeriesValues::empty_of(column.dtype());
            for &row in index.iter() {
                if row >= self.rows {
                    return Err(PopulationError::UnknownSimulant { simulant: row });
                }
                let value = column
                    .get(row)
                    .ok_or_else(|| PopulationError::UninitializedRead {
                        column: name.clone(),
                        simulant: row,
                    })?;
                values.push(value);
            }
            frame.push_column(name, values)?;
        }
        Ok(frame)
    }

    /// Rows of `index` whose `tracked` cell is true.
    pub fn tracked_subset(&self, index: &SimIndex) -> SimIndex {
        let Some(column) = self.columns.get(TRACKED_COLUMN) else {
            return index.clone();
        };
        index
            .iter()
            .copied()
            .filter(|&row| matches!(column.get(row), Some(Value::Bool(true))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_extends_every_column_with_nulls_except_tracked() {
        let mut table = StateTable::new("population_manager");
        let first = table.grow(3);
        table
            .add_column(
                "grower",
                &Series::floats("age", first.clone(), vec![1.0, 2.0, 3.0]),
            )
            .unwrap();
        let second = table.grow(2);
        assert_eq!(SimIndex::from_range(3..5), second);
        assert_eq!(5, table.len());
        // tracked is live immediately, age is null until initialized.
        assert_eq!(Some(Value::Bool(true)), table.column("tracked").unwrap().get(4));
        assert_eq!(None, table.column("age").unwrap().get(4));
        assert!(matches!(
            table.frame(&second, &["age".to_string()]),
            Err(PopulationError::UninitializedRead { .. })
        ));
    }

    #[test]
    fn column_dtype_is_fixed_at_creation() {
        let mut table = StateTable::new("population_manager");
        let index = table.grow(2);
        table
            .add_column("c", &Series::floats("age", index.clone(), vec![10.0, 20.0]))
            .unwrap();
        let err = table.write(&Series::strs(
            "age",
            index.clone(),
            vec!["ten".into(), "twenty".into()],
        ));
        assert!(matches!(err, Err(PopulationError::DtypeMismatch { .. })));
        // The failed write left the column untouched.
        let frame = table.frame(&index, &["age".to_string()]).unwrap();
        assert_eq!(Some(Value::Float(10.0)), frame.cell(0, "age"));
    }

    #[test]
    fn empty_index_produces_empty_frame_with_columns() {
        let mut table = StateTable::new("population_manager");
        let index = table.grow(2);
        table
            .add_column("c", &Series::ints("count", index, vec![1, 2]))
            .unwrap();
        let frame = table
            .frame(&SimIndex::empty(), &["count".to_string()])
            .unwrap();
        assert!(frame.is_empty());
        assert!(frame.has_column("count"));
    }

    #[test]
    fn missing_columns_are_reported() {
        let table = StateTable::new("population_manager");
        let err = table.frame(&SimIndex::empty(), &["nope".to_string()]);
        assert!(matches!(err, Err(PopulationError::MissingColumns(cols)) if cols == ["nope"]));
    }
}
