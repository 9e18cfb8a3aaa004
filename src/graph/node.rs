//! Resource declarations and their property values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ConfigError;

use super::cell::OutputCell;

/// Output attributes reported by a provider for one resource.
pub type Outputs = BTreeMap<String, Value>;

/// Key used to encode references in the canonical form of a property.
const REF_KEY: &str = "$ref";

/// A reference to one output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    /// Logical name of the referenced resource.
    pub resource: String,
    /// Output attribute to read.
    pub attribute: String,
}

impl OutputRef {
    /// Creates a reference to `resource.attribute`.
    #[must_use]
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parses a `${resource.attribute}` expression.
    ///
    /// Returns `None` if the text is not a reference expression at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the text looks like a reference but is malformed.
    pub fn parse_expression(text: &str) -> Result<Option<Self>, ConfigError> {
        let Some(body) = text.strip_prefix("${") else {
            return Ok(None);
        };

        let invalid = || ConfigError::InvalidReference {
            reference: text.to_string(),
        };

        let body = body.strip_suffix('}').ok_or_else(invalid)?;
        let (resource, attribute) = body.split_once('.').ok_or_else(invalid)?;

        if !is_identifier(resource) || !is_identifier(attribute) {
            return Err(invalid());
        }

        Ok(Some(Self::new(resource, attribute)))
    }

    /// Returns the `${resource.attribute}` expression for this reference.
    #[must_use]
    pub fn expression(&self) -> String {
        format!("${{{}.{}}}", self.resource, self.attribute)
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A declared property value: a literal or a reference to another resource.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A value known at declaration time.
    Literal(Value),
    /// A value produced by another resource.
    Reference(OutputRef),
    /// A list that may contain references.
    List(Vec<PropertyValue>),
    /// A map that may contain references.
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Converts a parsed stack-file value into a property value.
    ///
    /// Strings of the exact form `${resource.attribute}` become references;
    /// a leading `$${` escapes a literal `${`.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference expression is malformed.
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::String(text) => {
                if let Some(escaped) = text.strip_prefix("$${") {
                    return Ok(Self::Literal(Value::String(format!("${{{escaped}"))));
                }
                match OutputRef::parse_expression(&text)? {
                    Some(reference) => Ok(Self::Reference(reference)),
                    None => Ok(Self::Literal(Value::String(text))),
                }
            }
            Value::Array(items) => items
                .into_iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, item)| Self::from_json(item).map(|v| (key, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            other => Ok(Self::Literal(other)),
        }
    }

    /// Collects every reference contained in this value, recursively.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Returns the canonical form used for hashing and diffing.
    ///
    /// References are encoded as `{"$ref": "resource.attribute"}`. Literal
    /// map keys starting with `$` gain an extra leading `$`, so a literal
    /// `{"$ref": ...}` never encodes like a reference.
    #[must_use]
    pub fn canonical(&self) -> Value {
        match self {
            Self::Literal(value) => escape_literal(value),
            Self::Reference(reference) => {
                let mut map = serde_json::Map::new();
                map.insert(REF_KEY.to_string(), Value::String(reference.to_string()));
                Value::Object(map)
            }
            Self::List(items) => Value::Array(items.iter().map(Self::canonical).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (escape_key(key), item.canonical()))
                    .collect(),
            ),
        }
    }

    /// Substitutes every reference using `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not satisfy.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(reference) => lookup(reference).ok_or_else(|| reference.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(key, item)| item.resolve(lookup).map(|v| (key.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
        }
    }
}

fn escape_key(key: &str) -> String {
    if key.starts_with('$') {
        format!("${key}")
    } else {
        key.to_string()
    }
}

fn escape_literal(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(escape_literal).collect()),
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| (escape_key(key), escape_literal(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Literal(Value::String(value))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl From<OutputRef> for PropertyValue {
    fn from(value: OutputRef) -> Self {
        Self::Reference(value)
    }
}

impl From<Vec<Self>> for PropertyValue {
    fn from(value: Vec<Self>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Self>> for PropertyValue {
    fn from(value: BTreeMap<String, Self>) -> Self {
        Self::Map(value)
    }
}

/// A declared unit of infrastructure.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Unique logical name.
    name: String,
    /// Resource kind, `provider:type`.
    kind: String,
    /// Declared input properties.
    properties: BTreeMap<String, PropertyValue>,
    /// Outputs, available once provisioned.
    cell: OutputCell<Outputs>,
}

impl ResourceNode {
    /// Creates a node with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        let name = name.into();
        let cell = OutputCell::new(&name);
        Self {
            name,
            kind: kind.into(),
            properties: BTreeMap::new(),
            cell,
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets a property in place.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the provider prefix of the kind (`linode` in `linode:instance`).
    #[must_use]
    pub fn provider_prefix(&self) -> &str {
        self.kind.split_once(':').map_or(self.kind.as_str(), |(prefix, _)| prefix)
    }

    /// Returns the declared properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Returns the node's output cell.
    #[must_use]
    pub const fn cell(&self) -> &OutputCell<Outputs> {
        &self.cell
    }

    /// Returns a reference to one of this node's outputs.
    #[must_use]
    pub fn output(&self, attribute: &str) -> OutputRef {
        OutputRef::new(&self.name, attribute)
    }

    /// Returns every reference made by this node's properties.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Returns the names of the resources this node reads from.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.references()
            .into_iter()
            .map(|r| r.resource.clone())
            .collect()
    }

    /// Returns the properties in canonical form.
    #[must_use]
    pub fn declared(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .map(|(key, value)| (key.clone(), value.canonical()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference_expression() {
        let parsed = OutputRef::parse_expression("${seafileInstance.ipAddress}")
            .expect("valid reference");
        assert_eq!(parsed, Some(OutputRef::new("seafileInstance", "ipAddress")));

        assert_eq!(OutputRef::parse_expression("g6-standard-1").ok(), Some(None));
        assert!(OutputRef::parse_expression("${missing-dot}").is_err());
        assert!(OutputRef::parse_expression("${a.b").is_err());
    }

    #[test]
    fn test_nested_references_are_found() {
        let value = PropertyValue::from_json(json!([
            { "source": "${seafileVolume.label}", "target": "/shared" },
            { "name": "${seafileNetwork.name}", "aliases": ["seafile"] }
        ]))
        .expect("valid property");

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        let names: Vec<String> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["seafileVolume.label", "seafileNetwork.name"]);
    }

    #[test]
    fn test_escaped_dollar_is_literal() {
        let value = PropertyValue::from_json(json!("$${HOME}")).expect("valid");
        assert_eq!(value, PropertyValue::Literal(json!("${HOME}")));
    }

    #[test]
    fn test_literal_id_creates_no_dependency() {
        let node = ResourceNode::new("seafileARecord", "linode:domain-record")
            .with_property("domainId", 12345_i64)
            .with_property("target", OutputRef::new("seafileInstance", "ipAddress"));

        let deps: Vec<String> = node.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["seafileInstance"]);
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let node = ResourceNode::new("seafileVolume", "linode:volume")
            .with_property("size", 50_i64)
            .with_property("linodeId", OutputRef::new("seafileInstance", "id"));

        let lookup = |r: &OutputRef| (r.attribute == "id").then(|| json!("linode-1"));
        let resolved = node.properties()["linodeId"].resolve(&lookup);
        assert_eq!(resolved, Ok(json!("linode-1")));

        let missing = PropertyValue::from(OutputRef::new("seafileInstance", "label"));
        assert_eq!(
            missing.resolve(&lookup),
            Err(OutputRef::new("seafileInstance", "label"))
        );
    }

    #[test]
    fn test_canonical_encodes_references() {
        let node = ResourceNode::new("v", "linode:volume")
            .with_property("linodeId", OutputRef::new("i", "id"));
        assert_eq!(node.declared()["linodeId"], json!({ "$ref": "i.id" }));
        assert_eq!(node.provider_prefix(), "linode");
    }

    #[test]
    fn test_literal_ref_key_differs_from_reference() {
        let literal = PropertyValue::from_json(json!({ "$ref": "i.id" })).expect("valid");
        let reference = PropertyValue::from(OutputRef::new("i", "id"));

        assert_ne!(literal.canonical(), reference.canonical());
        assert_eq!(literal.canonical(), json!({ "$$ref": "i.id" }));

        let nested = PropertyValue::Literal(json!([{ "$ref": "i.id", "size": 1 }]));
        assert_eq!(nested.canonical(), json!([{ "$$ref": "i.id", "size": 1 }]));
    }
}
