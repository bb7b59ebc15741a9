//! Wire types: request inputs and response outputs of every store call.
//!
//! The same types serve as the arguments of [`Transport`](super::Transport)
//! and as the JSON-lines payloads of [`SocketTransport`](super::SocketTransport).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AttributeMap, AttributeValue};

// ---------------------------------------------------------------------------
// Single items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetItemInput {
    pub table: String,
    pub key: AttributeMap,
    #[serde(default)]
    pub consistent_read: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetItemOutput {
    pub item: Option<AttributeMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutItemInput {
    pub table: String,
    pub item: AttributeMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteItemInput {
    pub table: String,
    pub key: AttributeMap,
}

// ---------------------------------------------------------------------------
// Query / scan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryInput {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    pub key_condition_expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    pub scan_index_forward: bool,
    pub consistent_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_start_key: Option<AttributeMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanInput {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    pub consistent_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_start_key: Option<AttributeMap>,
}

/// One page of a query or scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageOutput {
    pub items: Vec<AttributeMap>,
    pub last_evaluated_key: Option<AttributeMap>,
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysAndAttributes {
    pub keys: Vec<AttributeMap>,
    pub consistent_read: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchGetInput {
    pub request_items: BTreeMap<String, KeysAndAttributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchGetOutput {
    pub responses: BTreeMap<String, Vec<AttributeMap>>,
    pub unprocessed_keys: BTreeMap<String, KeysAndAttributes>,
}

/// A single entry of a batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteRequest {
    Put { item: AttributeMap },
    Delete { key: AttributeMap },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchWriteInput {
    pub request_items: BTreeMap<String, Vec<WriteRequest>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchWriteOutput {
    pub unprocessed_items: BTreeMap<String, Vec<WriteRequest>>,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Enabling,
    #[default]
    Enabled,
    Disabling,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamViewType {
    KeysOnly,
    NewImage,
    OldImage,
    #[default]
    NewAndOldImages,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescribeStreamInput {
    pub stream_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_start_shard_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardDescription {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub starting_sequence_number: String,
    pub ending_sequence_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDescription {
    pub stream_arn: String,
    pub stream_status: StreamStatus,
    pub stream_view_type: StreamViewType,
    pub shards: Vec<ShardDescription>,
    /// Set when more shards remain to be described.
    pub last_evaluated_shard_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardIteratorType {
    TrimHorizon,
    Latest,
    AtSequenceNumber,
    AfterSequenceNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetShardIteratorInput {
    pub stream_arn: String,
    pub shard_id: String,
    pub shard_iterator_type: ShardIteratorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetShardIteratorOutput {
    pub shard_iterator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRecordsInput {
    pub shard_iterator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// A change record as delivered by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    /// `INSERT`, `MODIFY` or `REMOVE`.
    pub event_name: Option<String>,
    pub sequence_number: String,
    pub keys: AttributeMap,
    pub new_image: Option<AttributeMap>,
    pub old_image: Option<AttributeMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRecordsOutput {
    pub records: Vec<RawRecord>,
    /// `None` once the shard is closed and fully read.
    pub next_shard_iterator: Option<String>,
}

// ---------------------------------------------------------------------------
// Table administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDescription {
    pub table_name: String,
    pub stream_enabled: bool,
    pub latest_stream_arn: Option<String>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A request line, tagged by operation.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Request<'a> {
    GetItem(&'a GetItemInput),
    PutItem(&'a PutItemInput),
    DeleteItem(&'a DeleteItemInput),
    Query(&'a QueryInput),
    Scan(&'a ScanInput),
    BatchGetItem(&'a BatchGetInput),
    BatchWriteItem(&'a BatchWriteInput),
    DescribeStream(&'a DescribeStreamInput),
    GetShardIterator(&'a GetShardIteratorInput),
    GetRecords(&'a GetRecordsInput),
    DescribeTable { table: &'a str },
}

/// Error line: `{"error": "<code>", "message": "<text>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub message: String,
}
