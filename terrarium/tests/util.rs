#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use terrarium::prelude::*;
use terrarium::resource::ResourceId;

/// Creates the identity key columns (`entrance_time`, `birth_draw`) and
/// registers new simulants with the randomness system.
pub struct IdentityPopulation {
    view: Option<PopulationView>,
    stream: Option<RandomnessStream>,
}

impl IdentityPopulation {
    pub fn new() -> Self {
        IdentityPopulation {
            view: None,
            stream: None,
        }
    }
}

impl Component for IdentityPopulation {
    fn name(&self) -> String {
        "identity_population".to_string()
    }

    fn columns_created(&self) -> Vec<String> {
        vec!["entrance_time".to_string(), "birth_draw".to_string()]
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.view = Some(
            builder
                .population()
                .get_view(&["entrance_time", "birth_draw"])?,
        );
        self.stream = Some(builder.randomness().get_crn_initializing_stream("birth_draw")?);
        Ok(())
    }

    fn on_initialize_simulants(&mut self, data: &SimulantData, sim: &mut Simulation) -> Result<()> {
        let draws = self
            .stream
            .as_ref()
            .unwrap()
            .get_draw(sim, &data.index, None)?;
        let mut frame = Frame::new(data.index.clone());
        frame.push_series(Series::times(
            "entrance_time",
            data.index.clone(),
            vec![data.creation_time; data.index.len()],
        ))?;
        frame.push_series(Series::floats(
            "birth_draw",
            data.index.clone(),
            draws.as_floats()?.to_vec(),
        ))?;
        self.view
            .as_ref()
            .unwrap()
            .update(&mut sim.population, frame.clone())?;
        sim.randomness.register_simulants(&frame)?;
        Ok(())
    }
}

/// Creates a column `x` and redraws it from a stream every step, keeping a
/// log of each tick's draws.
pub struct UniformX {
    view: Option<PopulationView>,
    stream: Option<RandomnessStream>,
    requires_identity: bool,
    pub log: Rc<RefCell<Vec<Vec<f64>>>>,
}

impl UniformX {
    pub fn new(requires_identity: bool) -> (Self, Rc<RefCell<Vec<Vec<f64>>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            UniformX {
                view: None,
                stream: None,
                requires_identity,
                log: log.clone(),
            },
            log,
        )
    }
}

impl Component for UniformX {
    fn name(&self) -> String {
        "uniform_x".to_string()
    }

    fn columns_created(&self) -> Vec<String> {
        vec!["x".to_string()]
    }

    fn initialization_requires(&self) -> Vec<ResourceId> {
        let mut requires = vec![ResourceId::stream("x_draws")];
        if self.requires_identity {
            requires.push(ResourceId::column("birth_draw"));
        }
        requires
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.view = Some(builder.population().get_view(&["x"])?);
        self.stream = Some(builder.randomness().get_stream("x_draws")?);
        Ok(())
    }

    fn on_initialize_simulants(&mut self, data: &SimulantData, sim: &mut Simulation) -> Result<()> {
        let draws = self
            .stream
            .as_ref()
            .unwrap()
            .get_draw(sim, &data.index, None)?;
        self.view.as_ref().unwrap().update(
            &mut sim.population,
            Series::floats("x", data.index.clone(), draws.as_floats()?.to_vec()),
        )?;
        Ok(())
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::default())
    }

    fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        let draws = self
            .stream
            .as_ref()
            .unwrap()
            .get_draw(sim, &event.index, None)?;
        let values = draws.as_floats()?.to_vec();
        self.log.borrow_mut().push(values.clone());
        self.view.as_ref().unwrap().update(
            &mut sim.population,
            Series::floats("x", event.index.clone(), values),
        )?;
        Ok(())
    }
}

/// Appends its own name to a shared log when `time_step` fires.
pub struct Recorder {
    name: String,
    priority: u8,
    log: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &str, priority: u8, log: Rc<RefCell<Vec<String>>>) -> Self {
        Recorder {
            name: name.to_string(),
            priority,
            log,
        }
    }
}

impl Component for Recorder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::new(self.priority).unwrap())
    }

    fn on_time_step(&mut self, _event: &Event, _sim: &mut Simulation) -> Result<()> {
        self.log.borrow_mut().push(self.name.clone());
        Ok(())
    }
}

/// An initializer that requires a column someone else must create. Used to
/// build dependency chains and cycles.
pub struct ChainLink {
    name: &'static str,
    creates: &'static str,
    requires: Option<&'static str>,
    view: Option<PopulationView>,
}

impl ChainLink {
    pub fn new(name: &'static str, creates: &'static str, requires: Option<&'static str>) -> Self {
        ChainLink {
            name,
            creates,
            requires,
            view: None,
        }
    }
}

impl Component for ChainLink {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn columns_created(&self) -> Vec<String> {
        vec![self.creates.to_string()]
    }

    fn initialization_requires(&self) -> Vec<ResourceId> {
        self.requires.map(ResourceId::column).into_iter().collect()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.view = Some(builder.population().get_view(&[self.creates])?);
        Ok(())
    }

    fn on_initialize_simulants(&mut self, data: &SimulantData, sim: &mut Simulation) -> Result<()> {
        // Reading the prerequisite first proves the ordering: it blows up
        // on uninitialized cells if this initializer ran too early.
        let base = match self.requires {
            Some(required) => {
                let prior = sim
                    .population
                    .table()
                    .frame(&data.index, &[required.to_string()])?
                    .series(required)?;
                prior.as_floats()?.iter().map(|v| v + 1.0).collect()
            }
            None => vec![0.0; data.index.len()],
        };
        self.view.as_ref().unwrap().update(
            &mut sim.population,
            Series::floats(self.creates, data.index.clone(), base),
        )?;
        Ok(())
    }
}

/// Smuggles a stream handle out of setup for engine-level draw tests.
pub struct StreamProbe {
    pub key: &'static str,
    pub slot: Rc<RefCell<Option<RandomnessStream>>>,
}

impl StreamProbe {
    pub fn new(key: &'static str) -> (Self, Rc<RefCell<Option<RandomnessStream>>>) {
        let slot = Rc::new(RefCell::new(None));
        (
            StreamProbe {
                key,
                slot: slot.clone(),
            },
            slot,
        )
    }
}

impl Component for StreamProbe {
    fn name(&self) -> String {
        format!("stream_probe.{}", self.key)
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        *self.slot.borrow_mut() = Some(builder.randomness().get_stream(self.key)?);
        Ok(())
    }
}

/// Splits the population into two halves on a `group` column.
pub struct GroupedPopulation {
    view: Option<PopulationView>,
}

impl GroupedPopulation {
    pub fn new() -> Self {
        GroupedPopulation { view: None }
    }
}

impl Component for GroupedPopulation {
    fn name(&self) -> String {
        "grouped_population".to_string()
    }

    fn columns_created(&self) -> Vec<String> {
        vec!["group".to_string()]
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.view = Some(builder.population().get_view(&["group"])?);
        Ok(())
    }

    fn on_initialize_simulants(&mut self, data: &SimulantData, sim: &mut Simulation) -> Result<()> {
        let half = data.index.len() / 2;
        let groups: Vec<String> = (0..data.index.len())
            .map(|i| if i < half { "A".to_string() } else { "B".to_string() })
            .collect();
        self.view.as_ref().unwrap().update(
            &mut sim.population,
            Series::strs("group", data.index.clone(), groups),
        )?;
        Ok(())
    }
}

/// Decides a fifty-fifty "hit" each step and records which identities
/// (birth draws, as bit patterns) were hit on which tick.
pub struct HazardTracker {
    view: Option<PopulationView>,
    stream: Option<RandomnessStream>,
    tick: i64,
    pub hits: Rc<RefCell<Vec<(i64, Vec<u64>)>>>,
}

impl HazardTracker {
    pub fn new() -> (Self, Rc<RefCell<Vec<(i64, Vec<u64>)>>>) {
        let hits = Rc::new(RefCell::new(Vec::new()));
        (
            HazardTracker {
                view: None,
                stream: None,
                tick: 0,
                hits: hits.clone(),
            },
            hits,
        )
    }
}

impl Component for HazardTracker {
    fn name(&self) -> String {
        "hazard_tracker".to_string()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.view = Some(builder.population().get_view(&["birth_draw"])?);
        self.stream = Some(builder.randomness().get_stream("hazard")?);
        Ok(())
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::default())
    }

    fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        let hit = self.stream.as_ref().unwrap().filter_for_probability(
            sim,
            &event.index,
            0.5,
            None,
        )?;
        let draws = self
            .view
            .as_ref()
            .unwrap()
            .get(&sim.population, &hit, "")?
            .series("birth_draw")?;
        let mut identities: Vec<u64> = draws.as_floats()?.iter().map(|d| d.to_bits()).collect();
        identities.sort_unstable();
        self.hits.borrow_mut().push((self.tick, identities));
        self.tick += 1;
        Ok(())
    }
}

/// A bystander that burns draws from its own stream every step. Its
/// presence must not change anyone else's outcomes.
pub struct NoisyBystander {
    stream: Option<RandomnessStream>,
}

impl NoisyBystander {
    pub fn new() -> Self {
        NoisyBystander { stream: None }
    }
}

impl Component for NoisyBystander {
    fn name(&self) -> String {
        "noisy_bystander".to_string()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.stream = Some(builder.randomness().get_stream("bystander_noise")?);
        Ok(())
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::new(3).unwrap())
    }

    fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        let _ = self
            .stream
            .as_ref()
            .unwrap()
            .get_draw(sim, &event.index, Some("noise"))?;
        Ok(())
    }
}

/// Queues a batch of new simulants on a chosen tick.
pub struct Spawner {
    tick: i64,
    on_tick: i64,
    count: usize,
}

impl Spawner {
    pub fn new(on_tick: i64, count: usize) -> Self {
        Spawner {
            tick: 0,
            on_tick,
            count,
        }
    }
}

impl Component for Spawner {
    fn name(&self) -> String {
        "spawner".to_string()
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::new(2).unwrap())
    }

    fn on_time_step(&mut self, _event: &Event, sim: &mut Simulation) -> Result<()> {
        if self.tick == self.on_tick {
            sim.population
                .queue_simulants(self.count, std::collections::HashMap::new());
        }
        self.tick += 1;
        Ok(())
    }
}
