//! In-memory store used by the integration tests.
//!
//! Items are matched by the key attributes configured per table. Query and
//! scan evaluate only the `#nK = :v` terms of their expressions; anything
//! else is accepted as-is, so tests that care about other terms assert on the
//! logged request instead.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ferridyn_mapper::codec;
use ferridyn_mapper::transport::*;
use ferridyn_mapper::{
    AttributeMap, AttributeValue, Item, ItemSchema, KeyDescriptor, SequenceNumber, TableAdmin,
    Transport, TransportError,
};

type Result<T> = std::result::Result<T, TransportError>;

/// A logged request.
#[derive(Debug, Clone)]
pub enum Call {
    GetItem(GetItemInput),
    PutItem(PutItemInput),
    DeleteItem(DeleteItemInput),
    Query(QueryInput),
    Scan(ScanInput),
    BatchGet(BatchGetInput),
    BatchWrite(BatchWriteInput),
    DescribeStream(DescribeStreamInput),
    GetShardIterator(GetShardIteratorInput),
    GetRecords(GetRecordsInput),
    DescribeTable(String),
}

#[derive(Debug, Default)]
struct Table {
    key: Vec<String>,
    items: Vec<AttributeMap>,
}

impl Table {
    fn key_of(&self, item: &AttributeMap) -> AttributeMap {
        self.key
            .iter()
            .filter_map(|k| item.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    fn position(&self, key: &AttributeMap) -> Option<usize> {
        self.items.iter().position(|item| self.key_of(item) == self.key_of(key))
    }

    fn upsert(&mut self, item: AttributeMap) {
        match self.position(&item) {
            Some(i) => self.items[i] = item,
            None => self.items.push(item),
        }
    }

    fn remove(&mut self, key: &AttributeMap) {
        if let Some(i) = self.position(key) {
            self.items.remove(i);
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    id: String,
    parent: Option<String>,
    records: Vec<RawRecord>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Stream {
    status: StreamStatus,
    view: StreamViewType,
    shards: Vec<Shard>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    /// Largest query/scan page the store returns.
    page_size: Option<usize>,
    /// Pages handed back verbatim by the next query/scan calls.
    scripted_pages: VecDeque<PageOutput>,
    /// Tables whose batch items are never processed.
    stuck_tables: HashSet<String>,
    /// Upcoming batch calls that process nothing.
    unprocessed_calls: usize,
    /// Largest number of batch requests processed per call.
    batch_capacity: Option<usize>,
    streams: BTreeMap<String, Stream>,
    table_streams: BTreeMap<String, String>,
    /// Shards returned per describe page.
    describe_page: Option<usize>,
    /// Upcoming get_records calls that fail with an expired iterator.
    expired_iterators: usize,
    /// Upcoming calls that fail with a service error.
    failures: usize,
    calls: Vec<Call>,
}

/// Cloneable handle on a shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

pub fn attrs<T: Serialize>(value: T) -> AttributeMap {
    codec::to_attribute_map(&value).unwrap()
}

pub fn record(event: &str, seq: &str, image: serde_json::Value) -> RawRecord {
    let image = attrs(image);
    let mut raw = RawRecord {
        event_name: Some(event.to_string()),
        sequence_number: seq.to_string(),
        keys: image.iter().take(1).map(|(k, v)| (k.clone(), v.clone())).collect(),
        ..Default::default()
    };
    if event == "REMOVE" {
        raw.old_image = Some(image);
    } else {
        raw.new_image = Some(image);
    }
    raw
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, key: &[&str]) -> Self {
        self.state.lock().tables.insert(
            name.to_string(),
            Table {
                key: key.iter().map(|k| k.to_string()).collect(),
                items: Vec::new(),
            },
        );
        self
    }

    pub fn insert<T: Serialize>(&self, table: &str, item: T) {
        let mut state = self.state.lock();
        let table = state.tables.get_mut(table).expect("unknown table");
        table.upsert(attrs(item));
    }

    pub fn items(&self, table: &str) -> Vec<AttributeMap> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.items.clone())
            .unwrap_or_default()
    }

    pub fn set_page_size(&self, n: usize) {
        self.state.lock().page_size = Some(n);
    }

    pub fn script_page(&self, page: PageOutput) {
        self.state.lock().scripted_pages.push_back(page);
    }

    pub fn stick_table(&self, table: &str) {
        self.state.lock().stuck_tables.insert(table.to_string());
    }

    pub fn leave_unprocessed(&self, calls: usize) {
        self.state.lock().unprocessed_calls = calls;
    }

    pub fn set_batch_capacity(&self, n: usize) {
        self.state.lock().batch_capacity = Some(n);
    }

    pub fn fail_next(&self, calls: usize) {
        self.state.lock().failures = calls;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    // -- streams ------------------------------------------------------------

    pub fn enable_stream(&self, table: &str, arn: &str, view: StreamViewType) {
        let mut state = self.state.lock();
        state.table_streams.insert(table.to_string(), arn.to_string());
        state.streams.insert(
            arn.to_string(),
            Stream {
                status: StreamStatus::Enabled,
                view,
                shards: Vec::new(),
            },
        );
    }

    pub fn add_shard(&self, arn: &str, id: &str, parent: Option<&str>) {
        let mut state = self.state.lock();
        let stream = state.streams.get_mut(arn).expect("unknown stream");
        stream.shards.push(Shard {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            ..Default::default()
        });
    }

    pub fn push_record(&self, arn: &str, shard: &str, raw: RawRecord) {
        let mut state = self.state.lock();
        let stream = state.streams.get_mut(arn).expect("unknown stream");
        let shard = stream
            .shards
            .iter_mut()
            .find(|s| s.id == shard)
            .expect("unknown shard");
        shard.records.push(raw);
    }

    pub fn close_shard(&self, arn: &str, shard: &str) {
        let mut state = self.state.lock();
        if let Some(s) = state
            .streams
            .get_mut(arn)
            .and_then(|st| st.shards.iter_mut().find(|s| s.id == shard))
        {
            s.closed = true;
        }
    }

    pub fn set_stream_status(&self, arn: &str, status: StreamStatus) {
        if let Some(stream) = self.state.lock().streams.get_mut(arn) {
            stream.status = status;
        }
    }

    /// Disable a stream the way a store does: every shard stops growing.
    pub fn disable_stream(&self, arn: &str) {
        if let Some(stream) = self.state.lock().streams.get_mut(arn) {
            stream.status = StreamStatus::Disabled;
            for shard in &mut stream.shards {
                shard.closed = true;
            }
        }
    }

    pub fn drop_stream(&self, arn: &str) {
        self.state.lock().streams.remove(arn);
    }

    pub fn set_describe_page(&self, n: usize) {
        self.state.lock().describe_page = Some(n);
    }

    pub fn expire_iterators(&self, calls: usize) {
        self.state.lock().expired_iterators = calls;
    }
}

impl State {
    fn log(&mut self, call: Call) -> Result<()> {
        self.calls.push(call);
        if self.failures > 0 {
            self.failures -= 1;
            return Err(TransportError::Service {
                code: "InternalServerError".to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| TransportError::ResourceNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| TransportError::ResourceNotFound(name.to_string()))
    }

    /// Whether the next batch call leaves everything unprocessed.
    fn take_unprocessed_call(&mut self) -> bool {
        if self.unprocessed_calls > 0 {
            self.unprocessed_calls -= 1;
            true
        } else {
            false
        }
    }

    fn page(
        &self,
        table: &str,
        conditions: &[&str],
        names: &BTreeMap<String, String>,
        values: &BTreeMap<String, AttributeValue>,
        limit: Option<usize>,
        start: Option<&AttributeMap>,
        forward: bool,
    ) -> Result<PageOutput> {
        let table = self.table(table)?;
        let equalities: Vec<(String, AttributeValue)> = conditions
            .iter()
            .flat_map(|c| equality_terms(c, names, values))
            .collect();

        let mut matching: Vec<&AttributeMap> = table
            .items
            .iter()
            .filter(|item| equalities.iter().all(|(k, v)| item.get(k) == Some(v)))
            .collect();
        if !forward {
            matching.reverse();
        }

        let skip = match start {
            Some(key) => matching
                .iter()
                .position(|item| table.key_of(item) == *key)
                .map_or(0, |i| i + 1),
            None => 0,
        };
        let size = match (limit, self.page_size) {
            (Some(l), Some(p)) => l.min(p),
            (Some(n), None) | (None, Some(n)) => n,
            (None, None) => usize::MAX,
        };

        let rest = &matching[skip.min(matching.len())..];
        let items: Vec<AttributeMap> = rest.iter().take(size).map(|i| (*i).clone()).collect();
        let last_evaluated_key = if rest.len() > items.len() {
            items.last().map(|i| table.key_of(i))
        } else {
            None
        };
        Ok(PageOutput {
            items,
            last_evaluated_key,
        })
    }

    fn stream(&self, arn: &str) -> Result<&Stream> {
        self.streams
            .get(arn)
            .ok_or_else(|| TransportError::ResourceNotFound(arn.to_string()))
    }

    fn shard(&self, arn: &str, id: &str) -> Result<&Shard> {
        self.stream(arn)?
            .shards
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| TransportError::ResourceNotFound(id.to_string()))
    }
}

/// `(attribute, value)` pairs of the `#nK = :v` terms in `expr`.
fn equality_terms(
    expr: &str,
    names: &BTreeMap<String, String>,
    values: &BTreeMap<String, AttributeValue>,
) -> Vec<(String, AttributeValue)> {
    expr.split(" AND ")
        .filter_map(|term| {
            let term = term.trim_matches(|c| c == '(' || c == ')');
            let (lhs, rhs) = term.split_once(" = ")?;
            let name = names.get(lhs)?;
            let value = values.get(rhs)?;
            Some((name.clone(), value.clone()))
        })
        .collect()
}

fn iterator_for(arn: &str, shard: &str, pos: usize) -> String {
    format!("{arn}|{shard}|{pos}")
}

fn parse_iterator(iterator: &str) -> Option<(String, String, usize)> {
    let mut parts = iterator.rsplitn(3, '|');
    let pos = parts.next()?.parse().ok()?;
    let shard = parts.next()?.to_string();
    let arn = parts.next()?.to_string();
    Some((arn, shard, pos))
}

impl Transport for MockTransport {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput> {
        let mut state = self.state.lock();
        state.log(Call::GetItem(input.clone()))?;
        let table = state.table(&input.table)?;
        let item = table.position(&input.key).map(|i| table.items[i].clone());
        Ok(GetItemOutput { item })
    }

    async fn put_item(&self, input: PutItemInput) -> Result<()> {
        let mut state = self.state.lock();
        state.log(Call::PutItem(input.clone()))?;
        state.table_mut(&input.table)?.upsert(input.item);
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<()> {
        let mut state = self.state.lock();
        state.log(Call::DeleteItem(input.clone()))?;
        state.table_mut(&input.table)?.remove(&input.key);
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<PageOutput> {
        let mut state = self.state.lock();
        state.log(Call::Query(input.clone()))?;
        if let Some(page) = state.scripted_pages.pop_front() {
            return Ok(page);
        }
        let mut conditions = vec![input.key_condition_expression.as_str()];
        if let Some(filter) = &input.filter_expression {
            conditions.push(filter);
        }
        state.page(
            &input.table,
            &conditions,
            &input.expression_attribute_names,
            &input.expression_attribute_values,
            input.limit,
            input.exclusive_start_key.as_ref(),
            input.scan_index_forward,
        )
    }

    async fn scan(&self, input: ScanInput) -> Result<PageOutput> {
        let mut state = self.state.lock();
        state.log(Call::Scan(input.clone()))?;
        if let Some(page) = state.scripted_pages.pop_front() {
            return Ok(page);
        }
        let conditions: Vec<&str> = input.filter_expression.as_deref().into_iter().collect();
        state.page(
            &input.table,
            &conditions,
            &input.expression_attribute_names,
            &input.expression_attribute_values,
            input.limit,
            input.exclusive_start_key.as_ref(),
            true,
        )
    }

    async fn batch_get_item(&self, input: BatchGetInput) -> Result<BatchGetOutput> {
        let mut state = self.state.lock();
        state.log(Call::BatchGet(input.clone()))?;
        let skip_all = state.take_unprocessed_call();
        let mut budget = state.batch_capacity.unwrap_or(usize::MAX);

        let mut out = BatchGetOutput::default();
        for (name, request) in input.request_items {
            let stuck = skip_all || state.stuck_tables.contains(&name);
            let table = state.table(&name)?;
            for key in request.keys {
                if stuck || budget == 0 {
                    let entry = out.unprocessed_keys.entry(name.clone()).or_default();
                    entry.consistent_read = request.consistent_read;
                    entry.keys.push(key);
                    continue;
                }
                budget -= 1;
                if let Some(i) = table.position(&key) {
                    out.responses
                        .entry(name.clone())
                        .or_default()
                        .push(table.items[i].clone());
                }
            }
        }
        Ok(out)
    }

    async fn batch_write_item(&self, input: BatchWriteInput) -> Result<BatchWriteOutput> {
        let mut state = self.state.lock();
        state.log(Call::BatchWrite(input.clone()))?;
        let skip_all = state.take_unprocessed_call();
        let mut budget = state.batch_capacity.unwrap_or(usize::MAX);

        let mut out = BatchWriteOutput::default();
        for (name, requests) in input.request_items {
            let stuck = skip_all || state.stuck_tables.contains(&name);
            let table = state.table_mut(&name)?;
            for req in requests {
                if stuck || budget == 0 {
                    out.unprocessed_items.entry(name.clone()).or_default().push(req);
                    continue;
                }
                budget -= 1;
                match req {
                    WriteRequest::Put { item } => table.upsert(item),
                    WriteRequest::Delete { key } => table.remove(&key),
                }
            }
        }
        Ok(out)
    }

    async fn describe_stream(&self, input: DescribeStreamInput) -> Result<StreamDescription> {
        let mut state = self.state.lock();
        state.log(Call::DescribeStream(input.clone()))?;
        let page = state.describe_page.unwrap_or(usize::MAX);
        let stream = state.stream(&input.stream_arn)?;

        let skip = match &input.exclusive_start_shard_id {
            Some(id) => stream
                .shards
                .iter()
                .position(|s| &s.id == id)
                .map_or(0, |i| i + 1),
            None => 0,
        };
        let rest = &stream.shards[skip.min(stream.shards.len())..];
        let shards: Vec<ShardDescription> = rest
            .iter()
            .take(page)
            .map(|s| ShardDescription {
                shard_id: s.id.clone(),
                parent_shard_id: s.parent.clone(),
                starting_sequence_number: s
                    .records
                    .first()
                    .map_or_else(|| "0".to_string(), |r| r.sequence_number.clone()),
                ending_sequence_number: if s.closed {
                    s.records.last().map(|r| r.sequence_number.clone())
                } else {
                    None
                },
            })
            .collect();
        let last_evaluated_shard_id = if rest.len() > shards.len() {
            shards.last().map(|s| s.shard_id.clone())
        } else {
            None
        };

        Ok(StreamDescription {
            stream_arn: input.stream_arn,
            stream_status: stream.status,
            stream_view_type: stream.view,
            shards,
            last_evaluated_shard_id,
        })
    }

    async fn get_shard_iterator(
        &self,
        input: GetShardIteratorInput,
    ) -> Result<GetShardIteratorOutput> {
        let mut state = self.state.lock();
        state.log(Call::GetShardIterator(input.clone()))?;
        let shard = state.shard(&input.stream_arn, &input.shard_id)?;

        let pos = match input.shard_iterator_type {
            ShardIteratorType::TrimHorizon => 0,
            ShardIteratorType::Latest => shard.records.len(),
            ShardIteratorType::AtSequenceNumber | ShardIteratorType::AfterSequenceNumber => {
                let target = SequenceNumber::new(input.sequence_number.unwrap_or_default());
                let after = input.shard_iterator_type == ShardIteratorType::AfterSequenceNumber;
                shard
                    .records
                    .iter()
                    .position(|r| {
                        let seq = SequenceNumber::new(r.sequence_number.clone());
                        if after { seq > target } else { seq >= target }
                    })
                    .unwrap_or(shard.records.len())
            }
        };
        Ok(GetShardIteratorOutput {
            shard_iterator: Some(iterator_for(&input.stream_arn, &input.shard_id, pos)),
        })
    }

    async fn get_records(&self, input: GetRecordsInput) -> Result<GetRecordsOutput> {
        let mut state = self.state.lock();
        state.log(Call::GetRecords(input.clone()))?;
        if state.expired_iterators > 0 {
            state.expired_iterators -= 1;
            return Err(TransportError::ExpiredIterator(input.shard_iterator));
        }

        let (arn, shard_id, pos) = parse_iterator(&input.shard_iterator)
            .ok_or_else(|| TransportError::Protocol("bad shard iterator".to_string()))?;
        let shard = state.shard(&arn, &shard_id)?;

        let end = match input.limit {
            Some(n) => (pos + n).min(shard.records.len()),
            None => shard.records.len(),
        };
        let start = pos.min(end);
        let records = shard.records[start..end].to_vec();
        let next_shard_iterator = if shard.closed && end == shard.records.len() {
            None
        } else {
            Some(iterator_for(&arn, &shard_id, end))
        };
        Ok(GetRecordsOutput {
            records,
            next_shard_iterator,
        })
    }
}

impl TableAdmin for MockTransport {
    async fn describe_table(&self, table: &str) -> Result<TableDescription> {
        let mut state = self.state.lock();
        state.log(Call::DescribeTable(table.to_string()))?;
        let arn = state.table_streams.get(table).cloned();
        if arn.is_none() && !state.tables.contains_key(table) {
            return Err(TransportError::ResourceNotFound(table.to_string()));
        }
        Ok(TableDescription {
            table_name: table.to_string(),
            stream_enabled: arn.is_some(),
            latest_stream_arn: arn,
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Hash-and-range item with a local index on `title` and a global index on
/// `genre`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub no: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub genre: String,
}

impl Item for Track {
    fn schema() -> Option<ItemSchema> {
        Some(
            ItemSchema::new(KeyDescriptor::hash_range("album", "no"))
                .local_index("by_title", "title")
                .index("by_genre", KeyDescriptor::hash("genre")),
        )
    }
}

pub fn track(album: &str, no: u32, title: &str) -> Track {
    Track {
        album: album.to_string(),
        no,
        title: title.to_string(),
        genre: String::new(),
    }
}

/// Hash-only item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Album {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub year: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Item for Album {
    fn schema() -> Option<ItemSchema> {
        Some(ItemSchema::new(KeyDescriptor::hash("name")))
    }
}

pub fn album(name: &str, year: i64) -> Album {
    Album {
        name: name.to_string(),
        year,
        tags: Vec::new(),
    }
}

pub fn store() -> MockTransport {
    MockTransport::new()
        .with_table("tracks", &["album", "no"])
        .with_table("albums", &["name"])
}
