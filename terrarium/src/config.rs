//! A layered, read-mostly configuration tree.
//!
//! Values live in one of four layers, from innermost to outermost: `base`
//! (engine defaults), `component_configs` (defaults contributed by
//! components), `model_override` (the model specification), and `override`
//! (caller-supplied overrides). Reads return the outermost defined value;
//! writes target a named layer and record a source tag for diagnostics.
//! After setup the tree is frozen and rejects further writes.

use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::fmt;
use thiserror::Error;

/// The configuration layers, innermost first.
pub const LAYERS: [&str; 4] = ["base", "component_configs", "model_override", "override"];

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no configuration value at '{0}'")]
    MissingKey(String),
    #[error("configuration key '{key}' holds a {found}, expected a {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown configuration layer '{0}'")]
    UnknownLayer(String),
    #[error("cannot write to '{key}': the configuration is frozen")]
    Frozen { key: String },
    #[error(
        "'{key}' is a {found} in layer '{layer}' but a {expected} elsewhere; \
         layers must agree on the tree structure"
    )]
    StructureConflict {
        key: String,
        layer: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error(
        "both '{first}' and '{second}' provide a default for '{key}'; \
         component defaults may not overlap"
    )]
    DuplicatedDefault {
        key: String,
        first: String,
        second: String,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("duplicate component name '{0}'")]
    DuplicateComponentName(String),
    #[error("component at position {0} has an empty name")]
    EmptyComponentName(usize),
    #[error("cannot register {what} during the '{phase}' phase; registration is a setup-time operation")]
    RegistrationClosed { what: String, phase: String },
    #[error("resource '{resource}' is required by '{requirer}' but nothing produces it")]
    MissingResource { resource: String, requirer: String },
    #[error("the resource dependency graph contains a cycle through: {0}")]
    DependencyCycle(String),
    #[error("'{resource}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        resource: String,
        first: String,
        second: String,
    },
    #[error(
        "observations request stratifications that are not registered: {0}"
    )]
    UnknownStratifications(String),
    #[error("binned stratification '{name}' needs len(edges) == len(labels) + 1, got {edges} edges and {labels} labels")]
    BinMismatch {
        name: String,
        edges: usize,
        labels: usize,
    },
}

/// A single configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
            ConfigValue::List(_) => "list",
        }
    }

    fn from_yaml(value: &YamlValue) -> Result<ConfigValue, ConfigurationError> {
        Ok(match value {
            YamlValue::Null => ConfigValue::Null,
            YamlValue::Bool(b) => ConfigValue::Bool(*b),
            YamlValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ConfigValue::Int(i)
                } else {
                    ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            YamlValue::String(s) => ConfigValue::Str(s.clone()),
            YamlValue::Sequence(seq) => ConfigValue::List(
                seq.iter()
                    .map(ConfigValue::from_yaml)
                    .collect::<Result<_, _>>()?,
            ),
            other => {
                return Err(ConfigurationError::Parse(format!(
                    "unsupported configuration value: {other:?}"
                )));
            }
        })
    }

    fn to_yaml(&self) -> YamlValue {
        match self {
            ConfigValue::Null => YamlValue::Null,
            ConfigValue::Bool(b) => YamlValue::Bool(*b),
            ConfigValue::Int(i) => YamlValue::Number((*i).into()),
            ConfigValue::Float(f) => YamlValue::Number((*f).into()),
            ConfigValue::Str(s) => YamlValue::String(s.clone()),
            ConfigValue::List(items) => {
                YamlValue::Sequence(items.iter().map(ConfigValue::to_yaml).collect())
            }
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Null => write!(f, "null"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Str(s) => write!(f, "{s}"),
            ConfigValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}
impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}
impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}
impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

/// One value in one layer, with the tag of whoever wrote it.
#[derive(Debug, Clone)]
struct LayeredValue {
    layer: usize,
    value: ConfigValue,
    source: String,
}

#[derive(Debug, Clone)]
enum Node {
    /// Innermost-to-outermost values; at most one per layer.
    Leaf(Vec<LayeredValue>),
    Tree(IndexMap<String, Node>),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::Leaf(_) => "value",
            Node::Tree(_) => "mapping",
        }
    }
}

/// Whether a configuration path names a single value or a sub-mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Tree,
}

/// The layered configuration tree.
#[derive(Debug, Clone)]
pub struct ConfigTree {
    root: IndexMap<String, Node>,
    frozen: bool,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigTree {
    pub fn new() -> Self {
        ConfigTree {
            root: IndexMap::new(),
            frozen: false,
        }
    }

    /// Parse a YAML document into a fresh tree, placing all values in the
    /// named layer.
    pub fn from_yaml_str(yaml: &str, layer: &str, source: &str) -> Result<Self, ConfigurationError> {
        let mut tree = ConfigTree::new();
        tree.update_yaml_str(yaml, layer, source)?;
        Ok(tree)
    }

    /// Merge a YAML document into the named layer.
    pub fn update_yaml_str(
        &mut self,
        yaml: &str,
        layer: &str,
        source: &str,
    ) -> Result<(), ConfigurationError> {
        let parsed: YamlValue =
            serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        if matches!(parsed, YamlValue::Null) {
            return Ok(());
        }
        let layer_idx = layer_index(layer)?;
        let YamlValue::Mapping(mapping) = parsed else {
            return Err(ConfigurationError::Parse(
                "the top level of a configuration document must be a mapping".to_string(),
            ));
        };
        self.check_frozen("")?;
        merge_mapping(&mut self.root, &mapping, layer_idx, source, "")
    }

    /// Set a single value, addressed by a dotted path, in the named layer.
    pub fn update_value(
        &mut self,
        path: &str,
        value: impl Into<ConfigValue>,
        layer: &str,
        source: &str,
    ) -> Result<(), ConfigurationError> {
        self.check_frozen(path)?;
        let layer_idx = layer_index(layer)?;
        let mut current = &mut self.root;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            if last {
                let node = current
                    .entry(segment.to_string())
                    .or_insert_with(|| Node::Leaf(Vec::new()));
                let Node::Leaf(values) = node else {
                    return Err(ConfigurationError::StructureConflict {
                        key: path.to_string(),
                        layer: layer.to_string(),
                        expected: "mapping",
                        found: "value",
                    });
                };
                set_layer_value(values, layer_idx, value.into(), source);
                return Ok(());
            }
            let node = current
                .entry(segment.to_string())
                .or_insert_with(|| Node::Tree(IndexMap::new()));
            let Node::Tree(children) = node else {
                return Err(ConfigurationError::StructureConflict {
                    key: segments[..=i].join("."),
                    layer: layer.to_string(),
                    expected: "value",
                    found: "mapping",
                });
            };
            current = children;
        }
        Ok(())
    }

    /// Reject all further writes.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_frozen(&self, key: &str) -> Result<(), ConfigurationError> {
        if self.frozen {
            return Err(ConfigurationError::Frozen {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn lookup(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let node = current.get(*segment)?;
            if i + 1 == segments.len() {
                return Some(node);
            }
            match node {
                Node::Tree(children) => current = children,
                Node::Leaf(_) => return None,
            }
        }
        None
    }

    /// Whether `path` names a value, a sub-mapping, or nothing.
    pub fn node_kind(&self, path: &str) -> Option<NodeKind> {
        self.lookup(path).map(|node| match node {
            Node::Leaf(_) => NodeKind::Leaf,
            Node::Tree(_) => NodeKind::Tree,
        })
    }

    /// The outermost defined value at `path`.
    pub fn get(&self, path: &str) -> Result<&ConfigValue, ConfigurationError> {
        match self.lookup(path) {
            Some(Node::Leaf(values)) => values
                .last()
                .map(|lv| &lv.value)
                .ok_or_else(|| ConfigurationError::MissingKey(path.to_string())),
            _ => Err(ConfigurationError::MissingKey(path.to_string())),
        }
    }

    /// The layer and source tag of the outermost value at `path`.
    pub fn provenance(&self, path: &str) -> Result<(&str, &str), ConfigurationError> {
        match self.lookup(path) {
            Some(Node::Leaf(values)) => values
                .last()
                .map(|lv| (LAYERS[lv.layer], lv.source.as_str()))
                .ok_or_else(|| ConfigurationError::MissingKey(path.to_string())),
            _ => Err(ConfigurationError::MissingKey(path.to_string())),
        }
    }

    /// The value at `path` in one specific layer, with its source tag.
    pub fn layer_entry(
        &self,
        path: &str,
        layer: &str,
    ) -> Result<Option<(&ConfigValue, &str)>, ConfigurationError> {
        let layer_idx = layer_index(layer)?;
        match self.lookup(path) {
            Some(Node::Leaf(values)) => Ok(values
                .iter()
                .find(|lv| lv.layer == layer_idx)
                .map(|lv| (&lv.value, lv.source.as_str()))),
            _ => Ok(None),
        }
    }

    pub fn get_int(&self, path: &str) -> Result<i64, ConfigurationError> {
        match self.get(path)? {
            ConfigValue::Int(i) => Ok(*i),
            other => Err(self.type_mismatch(path, "int", other)),
        }
    }

    pub fn get_float(&self, path: &str) -> Result<f64, ConfigurationError> {
        match self.get(path)? {
            ConfigValue::Float(f) => Ok(*f),
            ConfigValue::Int(i) => Ok(*i as f64),
            other => Err(self.type_mismatch(path, "float", other)),
        }
    }

    pub fn get_bool(&self, path: &str) -> Result<bool, ConfigurationError> {
        match self.get(path)? {
            ConfigValue::Bool(b) => Ok(*b),
            other => Err(self.type_mismatch(path, "bool", other)),
        }
    }

    pub fn get_str(&self, path: &str) -> Result<&str, ConfigurationError> {
        match self.get(path)? {
            ConfigValue::Str(s) => Ok(s),
            other => Err(self.type_mismatch(path, "string", other)),
        }
    }

    pub fn get_str_list(&self, path: &str) -> Result<Vec<String>, ConfigurationError> {
        match self.get(path)? {
            ConfigValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ConfigValue::Str(s) => Ok(s.clone()),
                    other => Err(self.type_mismatch(path, "string list", other)),
                })
                .collect(),
            other => Err(self.type_mismatch(path, "list", other)),
        }
    }

    /// A value that may legitimately be null.
    pub fn get_optional_str(&self, path: &str) -> Result<Option<String>, ConfigurationError> {
        match self.get(path) {
            Ok(ConfigValue::Null) => Ok(None),
            Ok(ConfigValue::Str(s)) => Ok(Some(s.clone())),
            Ok(ConfigValue::Int(i)) => Ok(Some(i.to_string())),
            Ok(other) => Err(self.type_mismatch(path, "string or null", other)),
            Err(ConfigurationError::MissingKey(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn type_mismatch(
        &self,
        path: &str,
        expected: &'static str,
        found: &ConfigValue,
    ) -> ConfigurationError {
        ConfigurationError::TypeMismatch {
            key: path.to_string(),
            expected,
            found: found.kind(),
        }
    }

    /// Serialise the effective (outermost) values as a plain YAML mapping.
    pub fn to_yaml_string(&self) -> Result<String, ConfigurationError> {
        let value = YamlValue::Mapping(flatten(&self.root));
        serde_yaml::to_string(&value).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }
}

fn layer_index(layer: &str) -> Result<usize, ConfigurationError> {
    LAYERS
        .iter()
        .position(|l| *l == layer)
        .ok_or_else(|| ConfigurationError::UnknownLayer(layer.to_string()))
}

fn set_layer_value(values: &mut Vec<LayeredValue>, layer: usize, value: ConfigValue, source: &str) {
    if let Some(existing) = values.iter_mut().find(|lv| lv.layer == layer) {
        existing.value = value;
        existing.source = source.to_string();
    } else {
        values.push(LayeredValue {
            layer,
            value,
            source: source.to_string(),
        });
        values.sort_by_key(|lv| lv.layer);
    }
}

fn merge_mapping(
    target: &mut IndexMap<String, Node>,
    mapping: &serde_yaml::Mapping,
    layer: usize,
    source: &str,
    prefix: &str,
) -> Result<(), ConfigurationError> {
    for (key, value) in mapping {
        let YamlValue::String(key) = key else {
            return Err(ConfigurationError::Parse(format!(
                "configuration keys must be strings, got {key:?}"
            )));
        };
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            YamlValue::Mapping(child) => {
                let node = target
                    .entry(key.clone())
                    .or_insert_with(|| Node::Tree(IndexMap::new()));
                let Node::Tree(children) = node else {
                    return Err(ConfigurationError::StructureConflict {
                        key: path,
                        layer: LAYERS[layer].to_string(),
                        expected: "value",
                        found: "mapping",
                    });
                };
                merge_mapping(children, child, layer, source, &path)?;
            }
            other => {
                let node = target
                    .entry(key.clone())
                    .or_insert_with(|| Node::Leaf(Vec::new()));
                let Node::Leaf(values) = node else {
                    return Err(ConfigurationError::StructureConflict {
                        key: path,
                        layer: LAYERS[layer].to_string(),
                        expected: "mapping",
                        found: "value",
                    });
                };
                set_layer_value(values, layer, ConfigValue::from_yaml(other)?, source);
            }
        }
    }
    Ok(())
}

fn flatten(tree: &IndexMap<String, Node>) -> serde_yaml::Mapping {
    let mut mapping = serde_yaml::Mapping::new();
    for (key, node) in tree {
        let value = match node {
            Node::Leaf(values) => match values.last() {
                Some(lv) => lv.value.to_yaml(),
                None => continue,
            },
            Node::Tree(children) => YamlValue::Mapping(flatten(children)),
        };
        mapping.insert(YamlValue::String(key.clone()), value);
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_layers_shadow_inner() {
        let mut tree = ConfigTree::new();
        tree.update_value("population.population_size", 100i64, "base", "defaults")
            .unwrap();
        tree.update_value("population.population_size", 5000i64, "override", "user")
            .unwrap();
        assert_eq!(5000, tree.get_int("population.population_size").unwrap());
        let (layer, source) = tree.provenance("population.population_size").unwrap();
        assert_eq!(("override", "user"), (layer, source));
    }

    #[test]
    fn layer_order_is_independent_of_write_order() {
        let mut tree = ConfigTree::new();
        tree.update_value("time.step_size", 7i64, "override", "user")
            .unwrap();
        tree.update_value("time.step_size", 1i64, "base", "defaults")
            .unwrap();
        assert_eq!(7, tree.get_int("time.step_size").unwrap());
    }

    #[test]
    fn frozen_tree_rejects_writes() {
        let mut tree = ConfigTree::new();
        tree.update_value("a", 1i64, "base", "t").unwrap();
        tree.freeze();
        assert!(matches!(
            tree.update_value("a", 2i64, "override", "t"),
            Err(ConfigurationError::Frozen { .. })
        ));
    }

    #[test]
    fn missing_key_and_type_mismatch() {
        let mut tree = ConfigTree::new();
        tree.update_value("time.start", 0i64, "base", "t").unwrap();
        assert!(matches!(
            tree.get("time.end"),
            Err(ConfigurationError::MissingKey(_))
        ));
        assert!(matches!(
            tree.get_str("time.start"),
            Err(ConfigurationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn structure_conflicts_are_rejected() {
        let mut tree = ConfigTree::new();
        tree.update_value("time.start", 0i64, "base", "t").unwrap();
        let err = tree.update_value("time.start.year", 2005i64, "override", "u");
        assert!(matches!(
            err,
            Err(ConfigurationError::StructureConflict { .. })
        ));
    }

    #[test]
    fn yaml_round_trip_preserves_effective_values() {
        let yaml = "\
time:
  start: 0
  end: 10
  step_size: 1
randomness:
  key_columns: [entrance_time, birth_draw]
  additional_seed: null
";
        let tree = ConfigTree::from_yaml_str(yaml, "model_override", "spec").unwrap();
        let dumped = tree.to_yaml_string().unwrap();
        let reloaded = ConfigTree::from_yaml_str(&dumped, "model_override", "spec").unwrap();
        assert_eq!(10, reloaded.get_int("time.end").unwrap());
        assert_eq!(
            vec!["entrance_time".to_string(), "birth_draw".to_string()],
            reloaded.get_str_list("randomness.key_columns").unwrap()
        );
        assert_eq!(
            None,
            reloaded.get_optional_str("randomness.additional_seed").unwrap()
        );
        assert_eq!(dumped, reloaded.to_yaml_string().unwrap());
    }

    #[test]
    fn node_kind_distinguishes_scalars_from_mappings() {
        let tree = ConfigTree::from_yaml_str(
            "time:\n  start:\n    year: 2005\n    month: 7\n    day: 2\n",
            "override",
            "user",
        )
        .unwrap();
        assert_eq!(Some(NodeKind::Tree), tree.node_kind("time.start"));
        assert_eq!(Some(NodeKind::Leaf), tree.node_kind("time.start.year"));
        assert_eq!(None, tree.node_kind("time.end"));
    }
}
