//! Named event channels with priority-ordered multicast.
//!
//! A channel holds ten priority buckets (0 fires first, 9 last); listeners
//! within a bucket fire in registration order. Events are value objects:
//! once emitted they are read-only.

use crate::clock::{SimDelta, SimTime};
use crate::component::ComponentId;
use crate::config::ConfigurationError;
use crate::population::{SimIndex, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use tracing::debug;

/// The standard lifecycle channels, in per-tick emission order.
pub const TIME_STEP_PREPARE: &str = "time_step__prepare";
pub const TIME_STEP: &str = "time_step";
pub const TIME_STEP_CLEANUP: &str = "time_step__cleanup";
pub const COLLECT_METRICS: &str = "collect_metrics";
pub const POST_SETUP: &str = "post_setup";
pub const SIMULATION_END: &str = "simulation_end";

/// The four within-tick phases an observation can trigger on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPhase {
    TimeStepPrepare,
    TimeStep,
    TimeStepCleanup,
    #[default]
    CollectMetrics,
}

impl TickPhase {
    pub fn channel(&self) -> &'static str {
        match self {
            TickPhase::TimeStepPrepare => TIME_STEP_PREPARE,
            TickPhase::TimeStep => TIME_STEP,
            TickPhase::TimeStepCleanup => TIME_STEP_CLEANUP,
            TickPhase::CollectMetrics => COLLECT_METRICS,
        }
    }

    pub fn from_channel(channel: &str) -> Option<TickPhase> {
        match channel {
            TIME_STEP_PREPARE => Some(TickPhase::TimeStepPrepare),
            TIME_STEP => Some(TickPhase::TimeStep),
            TIME_STEP_CLEANUP => Some(TickPhase::TimeStepCleanup),
            COLLECT_METRICS => Some(TickPhase::CollectMetrics),
            _ => None,
        }
    }
}

/// A listener priority: 0 (highest) through 9 (lowest), default 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: u8) -> Result<Self, ConfigurationError> {
        if value > 9 {
            return Err(ConfigurationError::Parse(format!(
                "listener priority must be in 0..=9, got {value}"
            )));
        }
        Ok(Priority(value))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

/// An immutable record of something happening to a set of simulants.
#[derive(Debug, Clone)]
pub struct Event {
    /// The simulants affected by this event.
    pub index: SimIndex,
    /// The simulation time at which the event was emitted.
    pub time: SimTime,
    /// The step size at emission.
    pub step_size: SimDelta,
    /// Extra data attached by the emitter.
    pub user_data: HashMap<String, Value>,
}

impl Event {
    /// A copy of this event narrowed to a new index.
    pub fn split(&self, index: SimIndex) -> Event {
        Event {
            index,
            time: self.time,
            step_size: self.step_size,
            user_data: self.user_data.clone(),
        }
    }
}

/// What a channel entry dispatches to. The engine resolves these against the
/// component arena; there are no stored closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerTarget {
    Component {
        component: ComponentId,
        hook: HookKind,
    },
    /// The results manager's gather pass for this channel.
    ResultsGather,
}

/// Which component hook a listener entry invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PostSetup,
    TimeStepPrepare,
    TimeStep,
    TimeStepCleanup,
    CollectMetrics,
    SimulationEnd,
    /// Dispatches to the generic `on_event` hook with the channel name.
    Custom,
}

#[derive(Debug, Default)]
struct Channel {
    buckets: [Vec<ListenerTarget>; 10],
}

/// A handle for emitting into a named channel from inside a hook. Emission
/// is deferred: the event fires after the current dispatch completes.
#[derive(Debug, Clone)]
pub struct Emitter {
    pub(crate) channel: String,
}

impl Emitter {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn emit(
        &self,
        events: &mut EventManager,
        index: SimIndex,
        user_data: HashMap<String, Value>,
    ) {
        events.queue_emit(&self.channel, index, user_data);
    }
}

/// Owns the channels and the deferred-emission queue.
#[derive(Debug, Default)]
pub struct EventManager {
    channels: IndexMap<String, Channel>,
    deferred: VecDeque<(String, SimIndex, HashMap<String, Value>)>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&mut self, channel: &str, target: ListenerTarget, priority: Priority) {
        debug!(channel, priority = priority.get(), "registered listener");
        self.channels
            .entry(channel.to_string())
            .or_default()
            .buckets[priority.get() as usize]
            .push(target);
    }

    pub fn get_emitter(&mut self, channel: &str) -> Emitter {
        self.channels.entry(channel.to_string()).or_default();
        Emitter {
            channel: channel.to_string(),
        }
    }

    /// The channel's listeners, flattened into dispatch order.
    pub fn listeners(&self, channel: &str) -> Vec<ListenerTarget> {
        match self.channels.get(channel) {
            Some(channel) => channel.buckets.iter().flatten().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn queue_emit(
        &mut self,
        channel: &str,
        index: SimIndex,
        user_data: HashMap<String, Value>,
    ) {
        self.deferred
            .push_back((channel.to_string(), index, user_data));
    }

    pub(crate) fn take_deferred(
        &mut self,
    ) -> Option<(String, SimIndex, HashMap<String, Value>)> {
        self.deferred.pop_front()
    }
}
