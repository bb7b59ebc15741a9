//! Multi-table batch coordinator.
//!
//! Items are registered per table, deduplicated by primary key, sent in
//! rounds of at most the configured batch size, and retried while the store
//! reports them unprocessed. Per-item failures are collected into a
//! [`BatchError`] keyed by table and input position.
//!
//! Bookkeeping is an arena of [`Slot`]s: one slot per distinct key, holding
//! every input index that shares it. Queues and the pending index refer to
//! slots by id.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::client::Client;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{BatchError, Error, ItemError, Result};
use crate::schema::{self, Item, SchemaCache};
use crate::transport::{
    BatchGetInput, BatchWriteInput, KeysAndAttributes, Transport, WriteRequest,
};
use crate::types::{AttributeMap, KeyDescriptor, MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS};

type Decoder<'a> =
    Box<dyn FnMut(usize, &AttributeMap) -> std::result::Result<(), ItemError> + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Put,
    Delete,
    Get,
}

/// One distinct key of one table.
#[derive(Debug)]
struct Slot {
    table: usize,
    /// Positions in the registered slice that share this key.
    indices: Vec<usize>,
    index_key: Vec<u8>,
    /// Full item for puts, key attributes for deletes and gets.
    payload: AttributeMap,
    attempts: usize,
}

struct TableState<'a> {
    name: String,
    /// Distinct key layouts seen in this table's items.
    keys: Vec<KeyDescriptor>,
    fresh: VecDeque<usize>,
    decode: Option<Decoder<'a>>,
}

pub(crate) struct BatchOp<'a> {
    kind: BatchKind,
    consistent: bool,
    tables: Vec<TableState<'a>>,
    slots: Vec<Slot>,
    /// Index key of every unsettled slot.
    pending: HashMap<Vec<u8>, usize>,
    retry: VecDeque<usize>,
    errors: BatchError,
    err: Option<Error>,
}

impl<'a> BatchOp<'a> {
    fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            consistent: false,
            tables: Vec::new(),
            slots: Vec::new(),
            pending: HashMap::new(),
            retry: VecDeque::new(),
            errors: BatchError::default(),
            err: None,
        }
    }

    /// Register a table's items. Returns the table id, or `None` if the
    /// operation already carries an error.
    fn register<I: Item>(
        &mut self,
        schemas: &SchemaCache,
        table: &str,
        items: &[I],
    ) -> Option<usize> {
        if self.err.is_some() {
            return None;
        }
        if self.tables.iter().any(|t| t.name == table) {
            self.err = Some(Error::DuplicateTableRegistration(table.to_string()));
            return None;
        }

        let t = self.tables.len();
        self.tables.push(TableState {
            name: table.to_string(),
            keys: Vec::new(),
            fresh: VecDeque::new(),
            decode: None,
        });

        for (i, item) in items.iter().enumerate() {
            if let Err(e) = self.add_item(schemas, t, i, item) {
                self.errors.insert(table, i, e);
            }
        }
        Some(t)
    }

    fn add_item<I: Item>(
        &mut self,
        schemas: &SchemaCache,
        t: usize,
        i: usize,
        item: &I,
    ) -> std::result::Result<(), ItemError> {
        let mut attrs =
            codec::to_attribute_map(item).map_err(|e| ItemError::Codec(e.to_string()))?;
        if self.kind == BatchKind::Put {
            attrs = codec::remove_empty_attributes(attrs);
        }
        let schema = schemas
            .schema_for::<I>(&attrs)
            .map_err(|e| ItemError::InvalidKey(e.to_string()))?;
        let key = schema::resolve_primary_key(&schema, &attrs)
            .map_err(|e| ItemError::InvalidKey(e.to_string()))?;

        let table = &mut self.tables[t];
        let index_key = codec::encode_index_key(&table.name, &schema.primary_key, &key.values)
            .map_err(|e| ItemError::Codec(e.to_string()))?;
        if !table.keys.contains(&schema.primary_key) {
            table.keys.push(schema.primary_key.clone());
        }

        let payload = match self.kind {
            BatchKind::Put => attrs,
            BatchKind::Delete | BatchKind::Get => key.values,
        };

        match self.pending.get(&index_key) {
            Some(&id) => {
                // Last occurrence wins; every position shares the outcome.
                let slot = &mut self.slots[id];
                slot.indices.push(i);
                slot.payload = payload;
            }
            None => {
                let id = self.slots.len();
                self.slots.push(Slot {
                    table: t,
                    indices: vec![i],
                    index_key: index_key.clone(),
                    payload,
                    attempts: 0,
                });
                self.pending.insert(index_key, id);
                table.fresh.push_back(id);
            }
        }
        Ok(())
    }

    /// Pick up to `size` slots: retries first, then fresh slots spread evenly
    /// across the tables that still have some.
    fn collect_round(&mut self, size: usize) -> Vec<usize> {
        let mut round = Vec::with_capacity(size);
        while round.len() < size {
            match self.retry.pop_front() {
                Some(id) => round.push(id),
                None => break,
            }
        }

        let active = self.tables.iter().filter(|t| !t.fresh.is_empty()).count();
        if active == 0 || round.len() >= size {
            return round;
        }
        let per_table = ((size - round.len()) / active).max(1);

        loop {
            let before = round.len();
            for table in &mut self.tables {
                let take = per_table
                    .min(size - round.len())
                    .min(table.fresh.len());
                round.extend(table.fresh.drain(..take));
            }
            if round.len() >= size || round.len() == before {
                break;
            }
        }
        round
    }

    fn table_id(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    /// The pending slot whose key matches `attrs`.
    fn find_slot(&self, t: usize, attrs: &AttributeMap) -> Option<usize> {
        let table = &self.tables[t];
        table.keys.iter().find_map(|key| {
            let index_key = codec::encode_index_key(&table.name, key, attrs).ok()?;
            self.pending.get(&index_key).copied()
        })
    }

    fn settle(&mut self, id: usize) {
        self.pending.remove(&self.slots[id].index_key);
    }

    fn fail_slot(&mut self, id: usize, err: ItemError) {
        let slot = &self.slots[id];
        let table = &self.tables[slot.table].name;
        for &i in &slot.indices {
            self.errors.insert(table, i, err.clone());
        }
    }

    /// Send one write round. Returns how many slots settled.
    async fn write_round<T: Transport>(
        &mut self,
        transport: &T,
        round: &[usize],
    ) -> Result<usize> {
        let mut request_items: BTreeMap<String, Vec<WriteRequest>> = BTreeMap::new();
        for &id in round {
            let slot = &mut self.slots[id];
            slot.attempts += 1;
            let req = match self.kind {
                BatchKind::Put => WriteRequest::Put {
                    item: slot.payload.clone(),
                },
                BatchKind::Delete | BatchKind::Get => WriteRequest::Delete {
                    key: slot.payload.clone(),
                },
            };
            request_items
                .entry(self.tables[slot.table].name.clone())
                .or_default()
                .push(req);
        }

        let out = transport
            .batch_write_item(BatchWriteInput { request_items })
            .await
            .map_err(Error::transport("batch write"))?;

        let mut unprocessed = HashSet::new();
        for (name, reqs) in &out.unprocessed_items {
            let Some(t) = self.table_id(name) else {
                continue;
            };
            for req in reqs {
                let attrs = match req {
                    WriteRequest::Put { item } => item,
                    WriteRequest::Delete { key } => key,
                };
                if let Some(id) = self.find_slot(t, attrs) {
                    unprocessed.insert(id);
                }
            }
        }

        let mut settled = 0;
        for &id in round {
            if unprocessed.contains(&id) {
                self.retry.push_back(id);
            } else {
                self.settle(id);
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Send one get round. Returned items are decoded into every position
    /// sharing their key; keys neither returned nor unprocessed are absent.
    async fn get_round<T: Transport>(
        &mut self,
        transport: &T,
        round: &[usize],
    ) -> Result<usize> {
        let mut request_items: BTreeMap<String, KeysAndAttributes> = BTreeMap::new();
        for &id in round {
            let slot = &mut self.slots[id];
            slot.attempts += 1;
            let entry = request_items
                .entry(self.tables[slot.table].name.clone())
                .or_default();
            entry.consistent_read = self.consistent;
            entry.keys.push(slot.payload.clone());
        }

        let out = transport
            .batch_get_item(BatchGetInput { request_items })
            .await
            .map_err(Error::transport("batch get"))?;

        let in_round: HashSet<usize> = round.iter().copied().collect();
        let mut returned = HashSet::new();
        for (name, items) in &out.responses {
            let Some(t) = self.table_id(name) else {
                continue;
            };
            for attrs in items {
                let Some(id) = self.find_slot(t, attrs) else {
                    continue;
                };
                if in_round.contains(&id) && returned.insert(id) {
                    self.deliver(id, attrs);
                }
            }
        }

        let mut unprocessed = HashSet::new();
        for (name, keys) in &out.unprocessed_keys {
            let Some(t) = self.table_id(name) else {
                continue;
            };
            for key in &keys.keys {
                if let Some(id) = self.find_slot(t, key) {
                    unprocessed.insert(id);
                }
            }
        }

        let mut settled = 0;
        for &id in round {
            if returned.contains(&id) {
                self.settle(id);
                settled += 1;
            } else if unprocessed.contains(&id) {
                self.retry.push_back(id);
            } else {
                self.fail_slot(id, ItemError::NotFound);
                self.settle(id);
                settled += 1;
            }
        }
        Ok(settled)
    }

    fn deliver(&mut self, id: usize, attrs: &AttributeMap) {
        let slot = &self.slots[id];
        let table = &mut self.tables[slot.table];
        let Some(decode) = table.decode.as_mut() else {
            return;
        };
        for &i in &slot.indices {
            if let Err(e) = decode(i, attrs) {
                self.errors.insert(&table.name, i, e);
            }
        }
    }

    pub(crate) async fn run<T: Transport>(
        mut self,
        transport: &T,
        config: &ClientConfig,
    ) -> Result<()> {
        if let Some(err) = self.err.take() {
            return Err(err);
        }

        // Deserialized configs bypass the clamping setters.
        let size = match self.kind {
            BatchKind::Get => config.batch_get_size.clamp(1, MAX_BATCH_GET_ITEMS),
            BatchKind::Put | BatchKind::Delete => {
                config.batch_write_size.clamp(1, MAX_BATCH_WRITE_ITEMS)
            }
        };

        let mut rounds = 0usize;
        let mut stalled = 0usize;
        while !self.pending.is_empty() {
            let round = self.collect_round(size);
            if round.is_empty() {
                break;
            }
            rounds += 1;
            debug!(
                round = rounds,
                items = round.len(),
                pending = self.pending.len(),
                "sending batch round"
            );

            let settled = match self.kind {
                BatchKind::Get => self.get_round(transport, &round).await?,
                BatchKind::Put | BatchKind::Delete => self.write_round(transport, &round).await?,
            };
            if settled > 0 {
                stalled = 0;
                continue;
            }

            stalled += 1;
            if stalled > config.max_batch_retries {
                warn!(
                    pending = self.pending.len(),
                    retries = config.max_batch_retries,
                    "batch retries exhausted"
                );
                break;
            }
            let delay = config.backoff_for(stalled);
            warn!(
                attempt = stalled,
                pending = self.pending.len(),
                delay_ms = delay.as_millis() as u64,
                "batch round made no progress, backing off"
            );
            tokio::time::sleep(delay).await;
        }

        self.finish()
    }

    fn finish(mut self) -> Result<()> {
        let mut leftover: Vec<usize> = self.pending.values().copied().collect();
        leftover.sort_unstable();
        for id in leftover {
            let err = match self.kind {
                BatchKind::Get => ItemError::NotFound,
                BatchKind::Put | BatchKind::Delete => ItemError::Unprocessed {
                    attempts: self.slots[id].attempts,
                },
            };
            self.fail_slot(id, err);
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Batch(self.errors))
        }
    }
}

// ---------------------------------------------------------------------------
// Public builders
// ---------------------------------------------------------------------------

/// Batch put across one or more tables.
pub struct BatchPut<'a, T> {
    client: &'a Client<T>,
    op: BatchOp<'static>,
}

impl<'a, T: Transport> BatchPut<'a, T> {
    pub(crate) fn new(client: &'a Client<T>) -> Self {
        Self {
            client,
            op: BatchOp::new(BatchKind::Put),
        }
    }

    /// Register the items to write to `table`. Each table may be registered once.
    pub fn put<I: Item>(mut self, table: &str, items: &[I]) -> Self {
        self.op.register(self.client.schemas(), table, items);
        self
    }

    pub async fn run(self) -> Result<()> {
        self.op
            .run(self.client.transport(), self.client.config())
            .await
    }
}

/// Batch delete across one or more tables.
pub struct BatchDelete<'a, T> {
    client: &'a Client<T>,
    op: BatchOp<'static>,
}

impl<'a, T: Transport> BatchDelete<'a, T> {
    pub(crate) fn new(client: &'a Client<T>) -> Self {
        Self {
            client,
            op: BatchOp::new(BatchKind::Delete),
        }
    }

    /// Register the items to delete from `table`. Only their primary keys are sent.
    pub fn delete<I: Item>(mut self, table: &str, items: &[I]) -> Self {
        self.op.register(self.client.schemas(), table, items);
        self
    }

    pub async fn run(self) -> Result<()> {
        self.op
            .run(self.client.transport(), self.client.config())
            .await
    }
}

/// Batch get across one or more tables. Each registered slice holds the keys
/// on the way in and is overwritten with the stored items on the way out.
pub struct BatchGet<'a, T> {
    client: &'a Client<T>,
    op: BatchOp<'a>,
}

impl<'a, T: Transport> BatchGet<'a, T> {
    pub(crate) fn new(client: &'a Client<T>) -> Self {
        Self {
            client,
            op: BatchOp::new(BatchKind::Get),
        }
    }

    pub fn get<I: Item>(mut self, table: &str, items: &'a mut [I]) -> Self {
        let Some(t) = self.op.register(self.client.schemas(), table, &*items) else {
            return self;
        };
        self.op.tables[t].decode = Some(Box::new(
            move |i: usize, attrs: &AttributeMap| -> std::result::Result<(), ItemError> {
                let decoded: I = codec::from_attribute_map(attrs)
                    .map_err(|e| ItemError::Codec(e.to_string()))?;
                if let Some(item) = items.get_mut(i) {
                    *item = decoded;
                }
                Ok(())
            },
        ));
        self
    }

    /// Request strongly consistent reads for every table.
    pub fn consistent(mut self) -> Self {
        self.op.consistent = true;
        self
    }

    pub async fn run(self) -> Result<()> {
        self.op
            .run(self.client.transport(), self.client.config())
            .await
    }
}
