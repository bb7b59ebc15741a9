//! Core types: attribute values, key descriptors, item schemas, resolved keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Maximum number of write requests in one batch-write call (matching DynamoDB).
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Maximum number of keys in one batch-get call (matching DynamoDB).
pub const MAX_BATCH_GET_ITEMS: usize = 100;

/// An attribute map as sent to and received from the store.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// A typed attribute value in the store's wire shape (`{"S": "..."}`, `{"N": "42"}`, ...).
///
/// Numbers travel as decimal strings so that no precision is lost in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    #[serde(rename = "S")]
    String(String),
    #[serde(rename = "N")]
    Number(String),
    #[serde(rename = "B")]
    Binary(Vec<u8>),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    #[serde(rename = "M")]
    Map(AttributeMap),
    #[serde(rename = "L")]
    List(Vec<AttributeValue>),
    #[serde(rename = "SS")]
    StringSet(Vec<String>),
    #[serde(rename = "NS")]
    NumberSet(Vec<String>),
    #[serde(rename = "BS")]
    BinarySet(Vec<Vec<u8>>),
}

impl AttributeValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "S",
            AttributeValue::Number(_) => "N",
            AttributeValue::Binary(_) => "B",
            AttributeValue::Bool(_) => "BOOL",
            AttributeValue::Null(_) => "NULL",
            AttributeValue::Map(_) => "M",
            AttributeValue::List(_) => "L",
            AttributeValue::StringSet(_) => "SS",
            AttributeValue::NumberSet(_) => "NS",
            AttributeValue::BinarySet(_) => "BS",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::Number(n.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

/// Role of a key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRole {
    /// Partition-selecting attribute.
    Hash,
    /// Within-partition ordering attribute.
    Range,
}

/// A single key attribute (name + role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub role: KeyRole,
}

/// The ordered key attributes of a table or index.
///
/// Declared descriptors always list the hash attribute first, followed by an
/// optional range attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    attributes: Vec<KeyAttribute>,
}

impl KeyDescriptor {
    /// A hash-only key.
    pub fn hash(name: &str) -> Self {
        Self {
            attributes: vec![KeyAttribute {
                name: name.to_string(),
                role: KeyRole::Hash,
            }],
        }
    }

    /// A composite hash + range key.
    pub fn hash_range(hash: &str, range: &str) -> Self {
        Self {
            attributes: vec![
                KeyAttribute {
                    name: hash.to_string(),
                    role: KeyRole::Hash,
                },
                KeyAttribute {
                    name: range.to_string(),
                    role: KeyRole::Range,
                },
            ],
        }
    }

    /// Key of an untyped document: every attribute it carries, in name order.
    pub(crate) fn document<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
        let attributes = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| KeyAttribute {
                name: name.clone(),
                role: if i == 0 { KeyRole::Hash } else { KeyRole::Range },
            })
            .collect();
        Self { attributes }
    }

    pub fn attributes(&self) -> &[KeyAttribute] {
        &self.attributes
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn hash_name(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.role == KeyRole::Hash)
            .map(|a| a.name.as_str())
    }

    pub fn range_name(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.role == KeyRole::Range)
            .map(|a| a.name.as_str())
    }

    /// Check the declared-key invariant: exactly one hash attribute, listed
    /// first, and at most one range attribute.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let hashes = self
            .attributes
            .iter()
            .filter(|a| a.role == KeyRole::Hash)
            .count();
        let ranges = self.attributes.len() - hashes;

        if hashes != 1 {
            return Err(SchemaError::InvalidKeySchema(format!(
                "expected exactly one hash attribute, found {hashes}"
            )));
        }
        if ranges > 1 {
            return Err(SchemaError::InvalidKeySchema(format!(
                "expected at most one range attribute, found {ranges}"
            )));
        }
        if self.attributes[0].role != KeyRole::Hash {
            return Err(SchemaError::InvalidKeySchema(
                "hash attribute must be listed first".to_string(),
            ));
        }
        if self.attributes.iter().any(|a| a.name.is_empty()) {
            return Err(SchemaError::InvalidKeySchema(
                "key attribute names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Kind of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Same hash attribute as the table.
    Local,
    /// Independent hash attribute.
    Global,
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub kind: IndexKind,
    pub key: KeyDescriptor,
    /// Attributes projected into the index. Always includes the table's
    /// primary key and the index's own key attributes.
    pub projections: Vec<String>,
}

/// Key layout of an item type: its primary key and secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSchema {
    pub primary_key: KeyDescriptor,
    pub indexes: Vec<IndexSchema>,
}

impl ItemSchema {
    pub fn new(primary_key: KeyDescriptor) -> Self {
        Self {
            primary_key,
            indexes: Vec::new(),
        }
    }

    /// Add a secondary index. The index is local when it shares the table's
    /// hash attribute and global otherwise.
    pub fn index(mut self, name: &str, key: KeyDescriptor) -> Self {
        let kind = if key.hash_name() == self.primary_key.hash_name() {
            IndexKind::Local
        } else {
            IndexKind::Global
        };

        let mut projections: Vec<String> = Vec::new();
        for attr in self.primary_key.names().chain(key.names()) {
            if !projections.iter().any(|p| p == attr) {
                projections.push(attr.to_string());
            }
        }

        self.indexes.push(IndexSchema {
            name: name.to_string(),
            kind,
            key,
            projections,
        });
        self
    }

    /// Add a local secondary index keyed by the table's hash attribute and
    /// the given range attribute.
    pub fn local_index(self, name: &str, range: &str) -> Self {
        let hash = self.primary_key.hash_name().unwrap_or_default().to_string();
        self.index(name, KeyDescriptor::hash_range(&hash, range))
    }

    /// Project extra attributes into an existing index.
    pub fn project(mut self, index: &str, attrs: &[&str]) -> Self {
        if let Some(idx) = self.indexes.iter_mut().find(|i| i.name == index) {
            for attr in attrs {
                if !idx.projections.iter().any(|p| p == attr) {
                    idx.projections.push((*attr).to_string());
                }
            }
        }
        self
    }

    /// Look up a secondary index by name.
    pub fn find_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Validate the primary key and every index key.
    pub fn validate(&self) -> Result<(), SchemaError> {
        self.primary_key.validate()?;
        for idx in &self.indexes {
            idx.key.validate().map_err(|e| {
                SchemaError::InvalidKeySchema(format!("index '{}': {e}", idx.name))
            })?;
        }
        Ok(())
    }
}

/// A key evaluated against an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKey {
    pub values: AttributeMap,
    /// `None` for the primary key.
    pub index_name: Option<String>,
    pub index_kind: Option<IndexKind>,
}

impl ResolvedKey {
    pub fn is_primary(&self) -> bool {
        self.index_name.is_none()
    }
}
