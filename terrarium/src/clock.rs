//! Simulation time.
//!
//! Time comes in two flavours: a unitless step counter and a wall-clock
//! timestamp. A simulation picks one flavour at construction (from the shape
//! of its `time.start` configuration) and uses it consistently; mixing
//! flavours in arithmetic is a programming error and panics.

use crate::config::{ConfigTree, ConfigurationError, NodeKind};
use hifitime::{Duration, Epoch, TimeUnits, Unit};
use std::cmp::Ordering;
use std::fmt;

/// The state-table column holding each simulant's next scheduled event time,
/// present only when `time.individual_steps` is enabled.
pub const NEXT_EVENT_TIME_COLUMN: &str = "next_event_time";
/// The state-table column holding each simulant's step size, present only
/// when `time.individual_steps` is enabled.
pub const STEP_SIZE_COLUMN: &str = "step_size";

/// A point in simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimTime {
    Ticks(i64),
    Stamp(Epoch),
}

/// A span of simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimDelta {
    Ticks(i64),
    Span(Duration),
}

impl SimTime {
    /// Seconds since the unix epoch for timestamps; the raw count for ticks.
    /// Used to reduce times to hashable integers.
    pub fn to_key_seconds(&self) -> i64 {
        match self {
            SimTime::Ticks(t) => *t,
            SimTime::Stamp(e) => e.to_unix_seconds() as i64,
        }
    }
}

impl SimDelta {
    /// The span expressed in years, treating one tick as one day.
    pub fn to_years(&self) -> f64 {
        match self {
            SimDelta::Ticks(t) => *t as f64 / 365.0,
            SimDelta::Span(d) => d.to_unit(Unit::Day) / 365.0,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            SimDelta::Ticks(t) => *t > 0,
            SimDelta::Span(d) => *d > Duration::ZERO,
        }
    }

    pub fn min(self, other: SimDelta) -> SimDelta {
        match (self, other) {
            (SimDelta::Ticks(a), SimDelta::Ticks(b)) => SimDelta::Ticks(a.min(b)),
            (SimDelta::Span(a), SimDelta::Span(b)) => SimDelta::Span(a.min(b)),
            (a, b) => mixed_flavours(&format!("{a}"), &format!("{b}")),
        }
    }
}

fn mixed_flavours(a: &str, b: &str) -> ! {
    panic!("cannot combine step-count and wall-clock time values ({a} vs {b})")
}

impl std::ops::Add<SimDelta> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimDelta) -> SimTime {
        match (self, rhs) {
            (SimTime::Ticks(t), SimDelta::Ticks(d)) => SimTime::Ticks(t + d),
            (SimTime::Stamp(e), SimDelta::Span(d)) => SimTime::Stamp(e + d),
            (a, b) => mixed_flavours(&format!("{a}"), &format!("{b}")),
        }
    }
}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (SimTime::Ticks(a), SimTime::Ticks(b)) => a.partial_cmp(b),
            (SimTime::Stamp(a), SimTime::Stamp(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimTime::Ticks(t) => write!(f, "{t}"),
            SimTime::Stamp(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for SimDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimDelta::Ticks(t) => write!(f, "{t}"),
            SimDelta::Span(d) => write!(f, "{d}"),
        }
    }
}

/// The two-operation clock interface plus stepping.
pub trait SimulationClock {
    fn time(&self) -> SimTime;
    fn stop_time(&self) -> SimTime;
    fn step_size(&self) -> SimDelta;
    /// Advance by an explicit span (used when per-simulant scheduling shrinks
    /// a step below the global step size).
    fn advance(&mut self, delta: SimDelta);

    /// Advance by the global step size.
    fn step_forward(&mut self) {
        self.advance(self.step_size());
    }

    fn is_finished(&self) -> bool {
        self.time() >= self.stop_time()
    }
}

impl fmt::Debug for dyn SimulationClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clock(time = {}, step = {})", self.time(), self.step_size())
    }
}

/// A unitless step-count clock.
#[derive(Debug, Clone)]
pub struct SimpleClock {
    time: i64,
    stop: i64,
    step: i64,
}

impl SimpleClock {
    pub const CONFIGURATION_DEFAULTS: &'static str = "\
time:
  start: 0
  end: 100
  step_size: 1
";

    pub fn from_config(config: &ConfigTree) -> Result<Self, ConfigurationError> {
        Ok(SimpleClock {
            time: config.get_int("time.start")?,
            stop: config.get_int("time.end")?,
            step: config.get_int("time.step_size")?,
        })
    }
}

impl SimulationClock for SimpleClock {
    fn time(&self) -> SimTime {
        SimTime::Ticks(self.time)
    }

    fn stop_time(&self) -> SimTime {
        SimTime::Ticks(self.stop)
    }

    fn step_size(&self) -> SimDelta {
        SimDelta::Ticks(self.step)
    }

    fn advance(&mut self, delta: SimDelta) {
        match delta {
            SimDelta::Ticks(d) => self.time += d,
            SimDelta::Span(d) => mixed_flavours(&format!("{}", self.time), &format!("{d}")),
        }
    }
}

/// A wall-clock timestamp-plus-duration clock.
#[derive(Debug, Clone)]
pub struct DateTimeClock {
    time: Epoch,
    stop: Epoch,
    step: Duration,
}

impl DateTimeClock {
    pub const CONFIGURATION_DEFAULTS: &'static str = "\
time:
  start:
    year: 2005
    month: 7
    day: 2
  end:
    year: 2010
    month: 7
    day: 2
  step_size: 1  # days
";

    pub fn from_config(config: &ConfigTree) -> Result<Self, ConfigurationError> {
        let step_days = config.get_float("time.step_size")?;
        Ok(DateTimeClock {
            time: date_from_config(config, "time.start")?,
            stop: date_from_config(config, "time.end")?,
            step: step_days.days(),
        })
    }
}

fn date_from_config(config: &ConfigTree, prefix: &str) -> Result<Epoch, ConfigurationError> {
    let year = config.get_int(&format!("{prefix}.year"))? as i32;
    let month = config.get_int(&format!("{prefix}.month"))? as u8;
    let day = config.get_int(&format!("{prefix}.day"))? as u8;
    Ok(Epoch::from_gregorian_utc_at_midnight(year, month, day))
}

impl SimulationClock for DateTimeClock {
    fn time(&self) -> SimTime {
        SimTime::Stamp(self.time)
    }

    fn stop_time(&self) -> SimTime {
        SimTime::Stamp(self.stop)
    }

    fn step_size(&self) -> SimDelta {
        SimDelta::Span(self.step)
    }

    fn advance(&mut self, delta: SimDelta) {
        match delta {
            SimDelta::Span(d) => self.time += d,
            SimDelta::Ticks(t) => mixed_flavours(&format!("{}", self.time), &format!("{t}")),
        }
    }
}

/// Merge the right clock's defaults into the base layer and build it.
///
/// The flavour is picked from the shape of `time.start`: a mapping selects
/// the wall-clock flavour, a scalar (or nothing) the step counter.
pub fn build_clock(config: &mut ConfigTree) -> Result<Box<dyn SimulationClock>, ConfigurationError> {
    let wants_datetime = matches!(config.node_kind("time.start"), Some(NodeKind::Tree));
    if wants_datetime {
        config.update_yaml_str(DateTimeClock::CONFIGURATION_DEFAULTS, "base", "clock")?;
        Ok(Box::new(DateTimeClock::from_config(config)?))
    } else {
        config.update_yaml_str(SimpleClock::CONFIGURATION_DEFAULTS, "base", "clock")?;
        Ok(Box::new(SimpleClock::from_config(config)?))
    }
}
