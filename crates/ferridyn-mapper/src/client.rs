//! Client facade: single-item operations and entry points for queries,
//! batches and streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::batch::{BatchDelete, BatchGet, BatchPut};
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{Error, Result, SchemaError, StreamError};
use crate::query::Query;
use crate::schema::{self, Item, SchemaCache};
use crate::stream::RecordIterator;
use crate::transport::{
    DeleteItemInput, GetItemInput, PutItemInput, QueryInput, TableAdmin, Transport,
};
use crate::types::{AttributeMap, IndexKind, ItemSchema, ResolvedKey};

/// A data-access client over a [`Transport`].
///
/// Cheap to share: the transport and the schema cache live behind `Arc`s.
pub struct Client<T> {
    transport: Arc<T>,
    config: ClientConfig,
    schemas: Arc<SchemaCache>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            schemas: Arc::clone(&self.schemas),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            schemas: Arc::new(SchemaCache::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Write an item. Empty strings and NULLs are dropped before sending.
    pub async fn put<I: Item>(&self, table: &str, item: &I) -> Result<()> {
        let attrs = codec::remove_empty_attributes(codec::to_attribute_map(item)?);
        let schema = self.schemas.schema_for::<I>(&attrs)?;
        schema::resolve_primary_key(&schema, &attrs)?;

        let input = PutItemInput {
            table: table.to_string(),
            item: attrs,
        };
        self.transport
            .put_item(input)
            .await
            .map_err(Error::transport("put item"))
    }

    /// Load the item identified by `key`, by primary key when it is set and
    /// otherwise through the first secondary index whose key is set.
    pub async fn get<I: Item>(&self, table: &str, key: &I) -> Result<I> {
        self.get_item(table, key, false).await
    }

    /// Like [`get`](Self::get) with a strongly consistent read. Global
    /// indexes do not support consistent reads and are read eventually
    /// consistent.
    pub async fn get_consistent<I: Item>(&self, table: &str, key: &I) -> Result<I> {
        self.get_item(table, key, true).await
    }

    async fn get_item<I: Item>(&self, table: &str, key_item: &I, consistent: bool) -> Result<I> {
        let attrs = codec::to_attribute_map(key_item)?;
        let schema = self.schemas.schema_for::<I>(&attrs)?;
        let key = schema::resolve_key(&schema, &attrs)?;

        let found = match &key.index_name {
            None => {
                let input = GetItemInput {
                    table: table.to_string(),
                    key: key.values,
                    consistent_read: consistent,
                };
                self.transport
                    .get_item(input)
                    .await
                    .map_err(Error::transport("get item"))?
                    .item
            }
            Some(index) => {
                let consistent = consistent && key.index_kind != Some(IndexKind::Global);
                self.get_by_index(table, index, &schema, &key, consistent)
                    .await?
            }
        };

        let item = found.ok_or(Error::NoSuchItem)?;
        Ok(codec::from_attribute_map(&item)?)
    }

    async fn get_by_index(
        &self,
        table: &str,
        index: &str,
        schema: &ItemSchema,
        key: &ResolvedKey,
        consistent: bool,
    ) -> Result<Option<AttributeMap>> {
        let index_schema = schema.find_index(index).ok_or(SchemaError::NoValidKey)?;

        // Attribute names go straight into placeholders so names holding
        // path characters are never parsed as expressions.
        let mut terms = Vec::new();
        let mut names = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (i, name) in index_schema.key.names().enumerate() {
            if let Some(v) = key.values.get(name) {
                let name_ph = format!("#n{}", names.len());
                let value_ph = format!(":v{}", i + 1);
                terms.push(format!("{name_ph} = {value_ph}"));
                names.insert(name_ph, name.to_string());
                values.insert(value_ph, v.clone());
            }
        }
        debug!(table, index, "get through secondary index");

        let input = QueryInput {
            table: table.to_string(),
            index_name: Some(index.to_string()),
            key_condition_expression: terms.join(" AND "),
            filter_expression: None,
            expression_attribute_names: names,
            expression_attribute_values: values,
            limit: Some(1),
            scan_index_forward: true,
            consistent_read: consistent,
            exclusive_start_key: None,
        };
        let page = self
            .transport
            .query(input)
            .await
            .map_err(Error::transport("query index"))?;
        Ok(page.items.into_iter().next())
    }

    /// Delete an item by its primary key.
    pub async fn delete<I: Item>(&self, table: &str, item: &I) -> Result<()> {
        let attrs = codec::to_attribute_map(item)?;
        let schema = self.schemas.schema_for::<I>(&attrs)?;
        let key = schema::resolve_primary_key(&schema, &attrs)?;

        let input = DeleteItemInput {
            table: table.to_string(),
            key: key.values,
        };
        self.transport
            .delete_item(input)
            .await
            .map_err(Error::transport("delete item"))
    }

    /// Start a query (with a hash filter) or scan (without one) on `table`.
    pub fn query(&self, table: &str) -> Query<T> {
        Query::new(Arc::clone(&self.transport), table)
    }

    /// Start a batch put. Chain [`BatchPut::put`] to add more tables.
    pub fn batch_put<I: Item>(&self, table: &str, items: &[I]) -> BatchPut<'_, T> {
        BatchPut::new(self).put(table, items)
    }

    /// Start a batch delete. Chain [`BatchDelete::delete`] to add more tables.
    pub fn batch_delete<I: Item>(&self, table: &str, items: &[I]) -> BatchDelete<'_, T> {
        BatchDelete::new(self).delete(table, items)
    }

    /// Start a batch get. `items` hold the keys and receive the stored items.
    /// Chain [`BatchGet::get`] to add more tables.
    pub fn batch_get<'a, I: Item>(&'a self, table: &str, items: &'a mut [I]) -> BatchGet<'a, T> {
        BatchGet::new(self).get(table, items)
    }

    /// Iterate over the records of a stream.
    pub fn stream_by_arn(&self, stream_arn: &str) -> RecordIterator<T> {
        RecordIterator::new(Arc::clone(&self.transport), stream_arn, &self.config)
    }
}

impl<T: Transport + TableAdmin> Client<T> {
    /// Iterate over the records of a table's latest stream.
    pub async fn stream(&self, table: &str) -> Result<RecordIterator<T>> {
        let desc = self
            .transport
            .describe_table(table)
            .await
            .map_err(Error::transport("describe table"))?;

        match desc.latest_stream_arn {
            Some(arn) if !arn.is_empty() => Ok(self.stream_by_arn(&arn)),
            _ => Err(StreamError::NotEnabled(table.to_string()).into()),
        }
    }
}
