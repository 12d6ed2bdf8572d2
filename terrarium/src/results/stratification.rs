//! Stratifications: named categorical partitions of the population.

use super::ResultsError;
use crate::population::{Frame, Value};
use std::collections::HashSet;

/// Maps each row of a prepared population frame to a category, or `None` to
/// drop the row (e.g. a value outside all bins).
pub type MapperFn = Box<dyn Fn(&Frame) -> anyhow::Result<Vec<Option<String>>>>;

pub struct Stratification {
    pub name: String,
    pub categories: Vec<String>,
    pub excluded_categories: Vec<String>,
    /// `None` reads the single input column directly as the category.
    pub mapper: Option<MapperFn>,
    pub requires_columns: Vec<String>,
    pub requires_values: Vec<String>,
}

impl std::fmt::Debug for Stratification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stratification")
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("excluded_categories", &self.excluded_categories)
            .finish()
    }
}

impl Stratification {
    /// The categories that actually appear in results.
    pub fn active_categories(&self) -> Vec<String> {
        self.categories
            .iter()
            .filter(|c| !self.excluded_categories.contains(c))
            .cloned()
            .collect()
    }

    /// One label per frame row: `Some(category)` to keep, `None` to drop
    /// (excluded category or no bin). A mapper output outside the category
    /// set is an error.
    pub(crate) fn apply(&self, frame: &Frame) -> Result<Vec<Option<String>>, ResultsError> {
        let raw = match &self.mapper {
            Some(mapper) => mapper(frame).map_err(|source| ResultsError::MapperFailed {
                stratification: self.name.clone(),
                message: source.to_string(),
            })?,
            None => {
                let input = self
                    .requires_columns
                    .first()
                    .or_else(|| self.requires_values.first())
                    .ok_or_else(|| ResultsError::NoInputs {
                        stratification: self.name.clone(),
                    })?;
                (0..frame.len())
                    .map(|pos| {
                        frame.cell(pos, input).map(|value| match value {
                            Value::Str(s) => s,
                            other => other.to_string(),
                        })
                    })
                    .collect()
            }
        };
        if raw.len() != frame.len() {
            return Err(ResultsError::MapperLengthMismatch {
                stratification: self.name.clone(),
                expected: frame.len(),
                found: raw.len(),
            });
        }

        let known: HashSet<&str> = self.categories.iter().map(String::as_str).collect();
        let excluded: HashSet<&str> = self
            .excluded_categories
            .iter()
            .map(String::as_str)
            .collect();
        raw.into_iter()
            .map(|label| match label {
                None => Ok(None),
                Some(label) if excluded.contains(label.as_str()) => Ok(None),
                Some(label) if known.contains(label.as_str()) => Ok(Some(label)),
                Some(label) => Err(ResultsError::UnknownCategory {
                    stratification: self.name.clone(),
                    value: label,
                }),
            })
            .collect()
    }
}

/// A mapper that cuts a numeric input into left-closed, right-open bins.
/// Values outside all bins are dropped.
pub(crate) fn binned_mapper(target: String, edges: Vec<f64>, labels: Vec<String>) -> MapperFn {
    Box::new(move |frame: &Frame| {
        let mut out = Vec::with_capacity(frame.len());
        for pos in 0..frame.len() {
            let value = match frame.cell(pos, &target) {
                Some(Value::Float(v)) => v,
                Some(Value::Int(v)) => v as f64,
                Some(other) => {
                    anyhow::bail!(
                        "binned stratification target '{target}' must be numeric, got {}",
                        other.dtype()
                    )
                }
                None => anyhow::bail!("binned stratification target '{target}' is missing"),
            };
            let label = edges
                .windows(2)
                .position(|edge| edge[0] <= value && value < edge[1])
                .map(|bin| labels[bin].clone());
            out.push(label);
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::{Series, SimIndex};

    fn frame() -> Frame {
        let index = SimIndex::from_range(0..4);
        let mut frame = Frame::new(index.clone());
        frame
            .push_series(Series::strs(
                "group",
                index.clone(),
                vec!["A".into(), "B".into(), "A".into(), "C".into()],
            ))
            .unwrap();
        frame
            .push_series(Series::floats("age", index, vec![4.0, 17.0, 30.0, 99.0]))
            .unwrap();
        frame
    }

    #[test]
    fn identity_stratification_reads_its_input_column() {
        let strat = Stratification {
            name: "group".into(),
            categories: vec!["A".into(), "B".into(), "C".into()],
            excluded_categories: vec![],
            mapper: None,
            requires_columns: vec!["group".into()],
            requires_values: vec![],
        };
        let labels = strat.apply(&frame()).unwrap();
        assert_eq!(
            vec![
                Some("A".to_string()),
                Some("B".to_string()),
                Some("A".to_string()),
                Some("C".to_string())
            ],
            labels
        );
    }

    #[test]
    fn excluded_categories_drop_rows() {
        let strat = Stratification {
            name: "group".into(),
            categories: vec!["A".into(), "B".into(), "C".into()],
            excluded_categories: vec!["C".into()],
            mapper: None,
            requires_columns: vec!["group".into()],
            requires_values: vec![],
        };
        let labels = strat.apply(&frame()).unwrap();
        assert_eq!(None, labels[3]);
    }

    #[test]
    fn out_of_set_categories_are_an_error() {
        let strat = Stratification {
            name: "group".into(),
            categories: vec!["A".into(), "B".into()],
            excluded_categories: vec![],
            mapper: None,
            requires_columns: vec!["group".into()],
            requires_values: vec![],
        };
        assert!(matches!(
            strat.apply(&frame()),
            Err(ResultsError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn bins_are_left_closed_right_open() {
        let mapper = binned_mapper(
            "age".into(),
            vec![0.0, 5.0, 18.0, 65.0],
            vec!["child".into(), "teen".into(), "adult".into()],
        );
        let labels = mapper(&frame()).unwrap();
        assert_eq!(
            vec![
                Some("child".to_string()),
                Some("teen".to_string()),
                Some("adult".to_string()),
                None
            ],
            labels
        );
    }
}
