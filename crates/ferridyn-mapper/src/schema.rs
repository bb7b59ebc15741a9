//! Item capability, schema cache and key resolution.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::is_zero;
use crate::error::SchemaError;
use crate::types::{AttributeMap, ItemSchema, KeyDescriptor, ResolvedKey};

/// A record the client can store and load.
///
/// Typed records return their key layout from [`Item::schema`]. Untyped JSON
/// documents return `None` and are keyed by every attribute they carry, in
/// name order.
///
/// ```
/// use ferridyn_mapper::{Item, ItemSchema, KeyDescriptor};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Movie {
///     title: String,
///     year: u32,
/// }
///
/// impl Item for Movie {
///     fn schema() -> Option<ItemSchema> {
///         Some(ItemSchema::new(KeyDescriptor::hash_range("title", "year")))
///     }
/// }
/// ```
pub trait Item: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> Option<ItemSchema>;
}

impl Item for serde_json::Map<String, Value> {
    fn schema() -> Option<ItemSchema> {
        None
    }
}

impl Item for HashMap<String, Value> {
    fn schema() -> Option<ItemSchema> {
        None
    }
}

/// Per-type schema cache.
///
/// Each declared schema is validated and stored on first use and never
/// invalidated. Two tasks racing on the same type compute identical schemas,
/// so whichever insert lands first is kept.
#[derive(Debug, Default)]
pub struct SchemaCache {
    schemas: RwLock<HashMap<TypeId, Arc<ItemSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The schema for `I`. For untyped documents it is derived from `attrs`
    /// and not cached.
    pub fn schema_for<I: Item>(&self, attrs: &AttributeMap) -> Result<Arc<ItemSchema>, SchemaError> {
        let type_id = TypeId::of::<I>();
        if let Some(schema) = self.schemas.read().get(&type_id) {
            return Ok(Arc::clone(schema));
        }

        match I::schema() {
            Some(schema) => {
                schema.validate()?;
                let mut schemas = self.schemas.write();
                let entry = schemas.entry(type_id).or_insert_with(|| Arc::new(schema));
                Ok(Arc::clone(entry))
            }
            None => Ok(Arc::new(ItemSchema::new(KeyDescriptor::document(
                attrs.keys(),
            )))),
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

/// Collect the values of `key` from `attrs`, failing on the first attribute
/// that is missing or zero.
fn key_values(key: &KeyDescriptor, attrs: &AttributeMap) -> Result<AttributeMap, String> {
    let mut values = AttributeMap::new();
    for name in key.names() {
        match attrs.get(name) {
            Some(v) if !is_zero(v) => {
                values.insert(name.to_string(), v.clone());
            }
            _ => return Err(name.to_string()),
        }
    }
    Ok(values)
}

/// Resolve the primary key of an item. A key with no attributes never
/// resolves.
pub fn resolve_primary_key(
    schema: &ItemSchema,
    attrs: &AttributeMap,
) -> Result<ResolvedKey, SchemaError> {
    if schema.primary_key.names().next().is_none() {
        return Err(SchemaError::NoValidKey);
    }
    let values = key_values(&schema.primary_key, attrs).map_err(SchemaError::IncompleteKey)?;
    Ok(ResolvedKey {
        values,
        index_name: None,
        index_kind: None,
    })
}

/// Resolve the first secondary index whose key attributes are all set.
pub fn resolve_secondary_key(schema: &ItemSchema, attrs: &AttributeMap) -> Option<ResolvedKey> {
    schema.indexes.iter().find_map(|idx| {
        key_values(&idx.key, attrs).ok().map(|values| ResolvedKey {
            values,
            index_name: Some(idx.name.clone()),
            index_kind: Some(idx.kind),
        })
    })
}

/// Resolve the primary key, falling back to a secondary index key.
pub fn resolve_key(schema: &ItemSchema, attrs: &AttributeMap) -> Result<ResolvedKey, SchemaError> {
    if let Ok(key) = resolve_primary_key(schema, attrs) {
        return Ok(key);
    }
    resolve_secondary_key(schema, attrs).ok_or(SchemaError::NoValidKey)
}
