mod util;

use std::cell::RefCell;
use std::rc::Rc;
use terrarium::prelude::*;
use terrarium::SimTime;

const SCHEDULED: &str = "\
population:
  population_size: 4
time:
  start: 0
  end: 6
  individual_steps: true
";

/// Records each tick's active-index size and snoozes simulant 0 on the
/// first tick.
struct Snoozer {
    tick: i64,
    pub sizes: Rc<RefCell<Vec<usize>>>,
}

impl Snoozer {
    fn new() -> (Self, Rc<RefCell<Vec<usize>>>) {
        let sizes = Rc::new(RefCell::new(Vec::new()));
        (
            Snoozer {
                tick: 0,
                sizes: sizes.clone(),
            },
            sizes,
        )
    }
}

impl Component for Snoozer {
    fn name(&self) -> String {
        "snoozer".to_string()
    }

    fn time_step_priority(&self) -> Option<Priority> {
        Some(Priority::default())
    }

    fn on_time_step(&mut self, event: &Event, sim: &mut Simulation) -> Result<()> {
        self.sizes.borrow_mut().push(event.index.len());
        if self.tick == 0 {
            sim.reschedule(&SimIndex::new(vec![0]), SimTime::Ticks(5), None)?;
        }
        self.tick += 1;
        Ok(())
    }
}

#[test]
fn snoozed_simulants_leave_the_active_population_until_due() -> Result<()> {
    let (snoozer, sizes) = Snoozer::new();
    let mut context = SimulationContext::new(vec![Box::new(snoozer)], Some(SCHEDULED))?;
    context.setup()?;
    context.initialize_simulants()?;
    context.run()?;
    // Tick 0 sees everyone; simulant 0 sleeps until its next event time (5)
    // enters the step horizon at tick 4.
    assert_eq!(vec![4, 3, 3, 3, 4, 4], *sizes.borrow());
    Ok(())
}

#[test]
fn scheduling_columns_belong_to_the_time_system() -> Result<()> {
    let (snoozer, _sizes) = Snoozer::new();
    let mut context = SimulationContext::new(vec![Box::new(snoozer)], Some(SCHEDULED))?;
    context.setup()?;
    context.initialize_simulants()?;
    let population = &context.simulation().population;
    assert_eq!(
        Some("time_manager"),
        population.column_creator("next_event_time")
    );
    assert_eq!(Some("time_manager"), population.column_creator("step_size"));
    Ok(())
}

#[test]
fn the_clock_advances_by_the_smallest_simulant_step() -> Result<()> {
    struct Hare;
    impl Component for Hare {
        fn name(&self) -> String {
            "hare".to_string()
        }

        fn time_step_prepare_priority(&self) -> Option<Priority> {
            Some(Priority::default())
        }

        fn on_time_step_prepare(&mut self, _event: &Event, sim: &mut Simulation) -> Result<()> {
            // One fast simulant pins the whole clock to one-tick steps.
            sim.reschedule(&SimIndex::new(vec![0]), SimTime::Ticks(0), Some(1.0))?;
            Ok(())
        }
    }

    let overrides = "\
population:
  population_size: 2
time:
  start: 0
  end: 4
  step_size: 2
  individual_steps: true
";
    let (snoozer, sizes) = Snoozer::new();
    let mut context =
        SimulationContext::new(vec![Box::new(Hare), Box::new(snoozer)], Some(overrides))?;
    context.setup()?;
    context.initialize_simulants()?;
    context.run()?;
    // A global step of 2 would cover 0..4 in two ticks; the pinned simulant
    // forces four one-tick steps.
    assert_eq!(4, sizes.borrow().len());
    Ok(())
}

#[test]
fn reschedule_requires_individual_steps() -> Result<()> {
    let (snoozer, _sizes) = Snoozer::new();
    let mut context = SimulationContext::new(
        vec![Box::new(snoozer)],
        Some("population: {population_size: 4}\ntime: {start: 0, end: 2}\n"),
    )?;
    context.setup()?;
    context.initialize_simulants()?;
    let error = context.run().unwrap_err();
    assert!(format!("{error:#}").contains("individual_steps"), "{error:#}");
    Ok(())
}
