//! The resource dependency graph.
//!
//! Components declare what they produce (columns, values, streams) and what
//! they require. The graph is frozen at the end of setup; its topological
//! order decides when each simulant initializer runs. Cycles and missing
//! producers are configuration errors, raised before any simulant exists.

use crate::config::ConfigurationError;
use crate::population::InitializerId;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    Column,
    Value,
    Stream,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Column => "column",
            ResourceType::Value => "value",
            ResourceType::Stream => "stream",
        };
        write!(f, "{s}")
    }
}

/// A typed resource name, e.g. `column.age` or `stream.mortality`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: ResourceType,
    pub name: String,
}

impl ResourceId {
    pub fn column(name: impl Into<String>) -> Self {
        ResourceId {
            kind: ResourceType::Column,
            name: name.into(),
        }
    }

    pub fn value(name: impl Into<String>) -> Self {
        ResourceId {
            kind: ResourceType::Value,
            name: name.into(),
        }
    }

    pub fn stream(name: impl Into<String>) -> Self {
        ResourceId {
            kind: ResourceType::Stream,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// What kind of producer a graph node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Initializer(InitializerId),
    Pipeline,
    Stream,
}

#[derive(Debug, Clone)]
struct ResourceGroup {
    name: String,
    kind: ProducerKind,
    produces: Vec<ResourceId>,
    requires: Vec<ResourceId>,
}

/// Collects producers during setup; sorts initializers for population
/// creation.
#[derive(Debug, Default)]
pub struct ResourceManager {
    groups: Vec<ResourceGroup>,
    producers: HashMap<ResourceId, usize>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer node. Every produced resource must have exactly
    /// one producer across the whole graph.
    pub fn add_producer(
        &mut self,
        name: &str,
        kind: ProducerKind,
        produces: Vec<ResourceId>,
        requires: Vec<ResourceId>,
    ) -> Result<(), ConfigurationError> {
        let idx = self.groups.len();
        for resource in &produces {
            if let Some(&existing) = self.producers.get(resource) {
                return Err(ConfigurationError::DuplicateProducer {
                    resource: resource.to_string(),
                    first: self.groups[existing].name.clone(),
                    second: name.to_string(),
                });
            }
        }
        for resource in &produces {
            self.producers.insert(resource.clone(), idx);
        }
        debug!(producer = name, produced = produces.len(), "registered resource producer");
        self.groups.push(ResourceGroup {
            name: name.to_string(),
            kind,
            produces,
            requires,
        });
        Ok(())
    }

    pub fn is_produced(&self, resource: &ResourceId) -> bool {
        self.producers.contains_key(resource)
    }

    /// Kahn's algorithm over the producer graph, restricted to initializer
    /// nodes in the output. The ready set is ordered by node name so the
    /// result is deterministic across runs.
    pub fn ordered_initializers(&self) -> Result<Vec<InitializerId>, ConfigurationError> {
        let n = self.groups.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for (idx, group) in self.groups.iter().enumerate() {
            for required in &group.requires {
                let Some(&producer) = self.producers.get(required) else {
                    return Err(ConfigurationError::MissingResource {
                        resource: required.to_string(),
                        requirer: group.name.clone(),
                    });
                };
                if producer == idx {
                    continue;
                }
                dependents[producer].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut ready: BTreeSet<(&str, usize)> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(idx, _)| in_degree[*idx] == 0)
            .map(|(idx, group)| (group.name.as_str(), idx))
            .collect();

        let mut order = Vec::with_capacity(n);
        let mut seen = 0;
        while let Some(&(name, idx)) = ready.iter().next() {
            ready.remove(&(name, idx));
            seen += 1;
            if let ProducerKind::Initializer(id) = self.groups[idx].kind {
                order.push(id);
            }
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert((self.groups[dependent].name.as_str(), dependent));
                }
            }
        }

        if seen < n {
            let mut cycle: Vec<&str> = self
                .groups
                .iter()
                .enumerate()
                .filter(|(idx, _)| in_degree[*idx] > 0)
                .map(|(_, group)| group.name.as_str())
                .collect();
            cycle.sort_unstable();
            return Err(ConfigurationError::DependencyCycle(cycle.join(", ")));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentId;

    fn init(id: usize) -> ProducerKind {
        ProducerKind::Initializer(InitializerId::Component(ComponentId(id)))
    }

    #[test]
    fn initializers_run_after_their_requirements() {
        let mut resources = ResourceManager::new();
        resources
            .add_producer(
                "mortality",
                init(1),
                vec![ResourceId::column("alive")],
                vec![ResourceId::column("age"), ResourceId::stream("deaths")],
            )
            .unwrap();
        resources
            .add_producer(
                "ages",
                init(0),
                vec![ResourceId::column("age")],
                vec![],
            )
            .unwrap();
        resources
            .add_producer("deaths", ProducerKind::Stream, vec![ResourceId::stream("deaths")], vec![])
            .unwrap();

        let order = resources.ordered_initializers().unwrap();
        assert_eq!(
            vec![
                InitializerId::Component(ComponentId(0)),
                InitializerId::Component(ComponentId(1)),
            ],
            order
        );
    }

    #[test]
    fn ties_break_by_name() {
        let mut resources = ResourceManager::new();
        for (name, id) in [("zebra", 0), ("aardvark", 1), ("moose", 2)] {
            resources
                .add_producer(name, init(id), vec![ResourceId::column(name)], vec![])
                .unwrap();
        }
        let order = resources.ordered_initializers().unwrap();
        assert_eq!(
            vec![
                InitializerId::Component(ComponentId(1)),
                InitializerId::Component(ComponentId(2)),
                InitializerId::Component(ComponentId(0)),
            ],
            order
        );
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let mut resources = ResourceManager::new();
        resources
            .add_producer(
                "a_maker",
                init(0),
                vec![ResourceId::column("a")],
                vec![ResourceId::column("b")],
            )
            .unwrap();
        resources
            .add_producer(
                "b_maker",
                init(1),
                vec![ResourceId::column("b")],
                vec![ResourceId::column("a")],
            )
            .unwrap();
        let err = resources.ordered_initializers().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a_maker") && message.contains("b_maker"), "{message}");
    }

    #[test]
    fn missing_producers_are_reported() {
        let mut resources = ResourceManager::new();
        resources
            .add_producer(
                "needs_ghost",
                init(0),
                vec![ResourceId::column("real")],
                vec![ResourceId::column("ghost")],
            )
            .unwrap();
        let err = resources.ordered_initializers().unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingResource { .. }));
        assert!(err.to_string().contains("column.ghost"));
    }

    #[test]
    fn duplicate_producers_are_rejected() {
        let mut resources = ResourceManager::new();
        resources
            .add_producer("first", init(0), vec![ResourceId::value("rate")], vec![])
            .unwrap();
        let err = resources.add_producer("second", init(1), vec![ResourceId::value("rate")], vec![]);
        assert!(matches!(err, Err(ConfigurationError::DuplicateProducer { .. })));
    }
}
