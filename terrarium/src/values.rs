//! The value pipeline system.
//!
//! A pipeline is a named computation over a population index: one source,
//! an ordered chain of modifiers, and an optional post-processor. Pipelines
//! are late-bound: a handle may be requested before the producer is
//! registered, but calling an unsourced pipeline is an error.

use crate::population::{Series, SimIndex};
use crate::simulation::Simulation;
use anyhow::Result;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("no source registered for the value pipeline '{0}'")]
    MissingSource(String),
    #[error("a source is already registered for the value pipeline '{0}'")]
    DuplicateSource(String),
}

/// The source of a pipeline: a pure function of the population index.
pub type SourceFn = Box<dyn Fn(&Simulation, &SimIndex) -> Result<Series>>;
/// A modifier: receives the prior value and returns a new one.
pub type ModifierFn = Box<dyn Fn(&Simulation, &SimIndex, Series) -> Result<Series>>;
/// A post-processor applied after all modifiers.
pub type PostFn = Box<dyn Fn(&Simulation, Series) -> Result<Series>>;

pub enum PostProcessor {
    /// Convert annual rates into per-step probabilities:
    /// `1 - exp(-rate * step_size_in_years)`.
    Rescale,
    Custom(PostFn),
}

impl std::fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostProcessor::Rescale => write!(f, "Rescale"),
            PostProcessor::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A cheap, late-bound handle to a named pipeline.
#[derive(Debug, Clone)]
pub struct ValueHandle {
    pub(crate) name: String,
}

impl ValueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self, sim: &Simulation, index: &SimIndex) -> Result<Series> {
        sim.values.compute(sim, &self.name, index)
    }
}

struct Pipeline {
    source: Option<SourceFn>,
    modifiers: Vec<ModifierFn>,
    post_processor: Option<PostProcessor>,
    /// Declared inputs (columns, streams, other values); becomes this
    /// pipeline's edges in the resource graph when setup ends.
    requires: Vec<crate::resource::ResourceId>,
}

impl Pipeline {
    fn unsourced() -> Self {
        Pipeline {
            source: None,
            modifiers: Vec::new(),
            post_processor: None,
            requires: Vec::new(),
        }
    }
}

/// Owns all registered pipelines.
#[derive(Default)]
pub struct ValuesManager {
    pipelines: IndexMap<String, Pipeline>,
}

impl std::fmt::Debug for ValuesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuesManager")
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValuesManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn pipeline_entry(&mut self, name: &str) -> &mut Pipeline {
        self.pipelines
            .entry(name.to_string())
            .or_insert_with(Pipeline::unsourced)
    }

    pub fn register_value_producer(
        &mut self,
        name: &str,
        source: SourceFn,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<(), ValuesError> {
        self.register_with_post(name, source, None, requires)
    }

    /// A producer whose output is converted from annual rates to per-step
    /// probabilities.
    pub fn register_rate_producer(
        &mut self,
        name: &str,
        source: SourceFn,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<(), ValuesError> {
        self.register_with_post(name, source, Some(PostProcessor::Rescale), requires)
    }

    pub fn register_with_post(
        &mut self,
        name: &str,
        source: SourceFn,
        post_processor: Option<PostProcessor>,
        requires: Vec<crate::resource::ResourceId>,
    ) -> Result<(), ValuesError> {
        let pipeline = self.pipeline_entry(name);
        if pipeline.source.is_some() {
            return Err(ValuesError::DuplicateSource(name.to_string()));
        }
        debug!(pipeline = name, "registered value producer");
        pipeline.source = Some(source);
        pipeline.post_processor = post_processor;
        pipeline.requires.extend(requires);
        Ok(())
    }

    /// Modifiers apply in registration order.
    pub fn register_value_modifier(
        &mut self,
        name: &str,
        modifier: ModifierFn,
        requires: Vec<crate::resource::ResourceId>,
    ) {
        debug!(pipeline = name, "registered value modifier");
        let pipeline = self.pipeline_entry(name);
        pipeline.modifiers.push(modifier);
        pipeline.requires.extend(requires);
    }

    /// Every pipeline's declared inputs, for wiring the resource graph when
    /// setup ends.
    pub(crate) fn declared_requirements(
        &self,
    ) -> impl Iterator<Item = (&str, &[crate::resource::ResourceId])> {
        self.pipelines
            .iter()
            .map(|(name, pipeline)| (name.as_str(), pipeline.requires.as_slice()))
    }

    pub fn get_value(&mut self, name: &str) -> ValueHandle {
        self.pipeline_entry(name);
        ValueHandle {
            name: name.to_string(),
        }
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.pipelines
            .get(name)
            .is_some_and(|p| p.source.is_some())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    /// Run a pipeline: source, then each modifier in registration order,
    /// then the post-processor.
    pub fn compute(&self, sim: &Simulation, name: &str, index: &SimIndex) -> Result<Series> {
        let pipeline = self
            .pipelines
            .get(name)
            .ok_or_else(|| ValuesError::MissingSource(name.to_string()))?;
        let source = pipeline
            .source
            .as_ref()
            .ok_or_else(|| ValuesError::MissingSource(name.to_string()))?;

        let mut value = source(sim, index)?;
        for modifier in &pipeline.modifiers {
            value = modifier(sim, index, value)?;
        }
        if let Some(post) = &pipeline.post_processor {
            value = match post {
                PostProcessor::Rescale => rescale(sim, value)?,
                PostProcessor::Custom(f) => f(sim, value)?,
            };
        }
        Ok(value)
    }
}

fn rescale(sim: &Simulation, series: Series) -> Result<Series> {
    let years = sim.clock.step_size().to_years();
    let rates = series.as_floats()?;
    let probabilities = rates.iter().map(|r| 1.0 - (-r * years).exp()).collect();
    Ok(Series::floats(series.name.clone(), series.index.clone(), probabilities))
}

/// The probability of any of several independent events:
/// `1 - prod(1 - p_i)`. Useful inside custom post-processors and sources
/// that join probability pipelines.
pub fn union_probability(name: &str, parts: &[Series]) -> Result<Series> {
    let first = parts
        .first()
        .ok_or_else(|| anyhow::anyhow!("union_probability needs at least one series"))?;
    let mut survival = vec![1.0; first.len()];
    for part in parts {
        for (s, p) in survival.iter_mut().zip(part.as_floats()?) {
            *s *= 1.0 - p;
        }
    }
    Ok(Series::floats(
        name,
        first.index.clone(),
        survival.into_iter().map(|s| 1.0 - s).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_combines_independent_probabilities() {
        let index = SimIndex::from_range(0..2);
        let a = Series::floats("a", index.clone(), vec![0.5, 0.0]);
        let b = Series::floats("b", index, vec![0.5, 0.25]);
        let joint = union_probability("joint", &[a, b]).unwrap();
        let values = joint.as_floats().unwrap();
        assert!((values[0] - 0.75).abs() < 1e-12);
        assert!((values[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn union_of_nothing_is_an_error() {
        assert!(union_probability("joint", &[]).is_err());
    }
}
