//! Change-stream consumer.
//!
//! A [`RecordIterator`] discovers the shards of one stream, reads them in
//! starting-sequence order and buffers their records. [`RecordIterator::has_next`]
//! drains what is currently available; [`RecordIterator::wait_next`] keeps
//! polling until a record arrives or the stream goes away.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{Error, Result, StreamError, TransportError};
use crate::transport::{
    DescribeStreamInput, GetRecordsInput, GetShardIteratorInput, RawRecord, ShardDescription,
    ShardIteratorType, StreamStatus, StreamViewType, Transport,
};
use crate::types::AttributeMap;

/// An opaque, totally ordered stream position.
///
/// Shorter tokens sort first and equal lengths compare lexicographically.
/// When both tokens are all ASCII digits their leading zeros are dropped
/// first, so decimal tokens of different widths still compare numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn ordering_key<'a>(&'a self, other: &'a SequenceNumber) -> (&'a str, &'a str) {
        let (a, b) = (self.0.as_str(), other.0.as_str());
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
        if digits(a) && digits(b) {
            (a.trim_start_matches('0'), b.trim_start_matches('0'))
        } else {
            (a, b)
        }
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = self.ordering_key(other);
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequenceNumber {}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shard and its sequence range. `end == None` marks the open shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: String,
    pub start: SequenceNumber,
    pub end: Option<SequenceNumber>,
}

impl Shard {
    pub fn contains(&self, seq: &SequenceNumber) -> bool {
        self.start <= *seq && self.end.as_ref().is_none_or(|end| seq <= end)
    }
}

impl From<ShardDescription> for Shard {
    fn from(desc: ShardDescription) -> Self {
        Self {
            id: desc.shard_id,
            start: SequenceNumber(desc.starting_sequence_number),
            end: desc.ending_sequence_number.map(SequenceNumber),
        }
    }
}

/// Kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Added,
    Updated,
    Deleted,
}

impl RecordType {
    fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "INSERT" => Some(RecordType::Added),
            "MODIFY" => Some(RecordType::Updated),
            "REMOVE" => Some(RecordType::Deleted),
            _ => None,
        }
    }
}

/// A decoded change record. Deletions carry the pre-deletion image.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub record_type: RecordType,
    pub sequence_number: SequenceNumber,
    pub image: AttributeMap,
}

impl StreamRecord {
    fn from_raw(raw: RawRecord, keys_only: bool) -> std::result::Result<Self, StreamError> {
        let name = raw
            .event_name
            .ok_or_else(|| StreamError::InvalidRecord("missing event name".to_string()))?;
        let record_type = RecordType::from_event_name(&name)
            .ok_or_else(|| StreamError::InvalidRecord(format!("unknown event name '{name}'")))?;

        let image = match record_type {
            RecordType::Deleted => raw.old_image,
            RecordType::Added | RecordType::Updated => raw.new_image,
        };
        let image = match image {
            Some(image) if !keys_only => image,
            _ if !raw.keys.is_empty() => raw.keys,
            _ => {
                return Err(StreamError::InvalidRecord(format!(
                    "record {} carries no image",
                    raw.sequence_number
                )));
            }
        };

        Ok(Self {
            record_type,
            sequence_number: SequenceNumber(raw.sequence_number),
            image,
        })
    }
}

/// Iterator over the records of one stream.
pub struct RecordIterator<T> {
    transport: Arc<T>,
    stream_arn: String,
    poll_interval: Duration,
    max_iterator_refreshes: usize,
    buffer: VecDeque<RawRecord>,
    described_shards: HashSet<String>,
    processed_shards: HashSet<String>,
    last_shard_id: Option<String>,
    last_seq: Option<SequenceNumber>,
    keys_only: bool,
    disabled: bool,
    closed: bool,
}

impl<T: Transport> RecordIterator<T> {
    pub(crate) fn new(transport: Arc<T>, stream_arn: &str, config: &ClientConfig) -> Self {
        Self {
            transport,
            stream_arn: stream_arn.to_string(),
            poll_interval: config.poll_interval,
            max_iterator_refreshes: config.max_iterator_refreshes,
            buffer: VecDeque::new(),
            described_shards: HashSet::new(),
            processed_shards: HashSet::new(),
            last_shard_id: None,
            last_seq: None,
            keys_only: false,
            disabled: false,
            closed: stream_arn.is_empty(),
        }
    }

    pub fn stream_arn(&self) -> &str {
        &self.stream_arn
    }

    /// Whether the stream or one of its shards has vanished.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a record is available now. Runs at most one discovery pass
    /// and never sleeps.
    pub async fn has_next(&mut self) -> Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        if self.closed {
            return Ok(false);
        }
        self.poll_once().await?;
        Ok(!self.buffer.is_empty())
    }

    /// Wait for the next record, polling every `poll_interval`.
    ///
    /// Returns `false` once the stream is disabled and every shard has been
    /// read to its end, or once the stream has vanished. There is no internal
    /// timeout; wrap the call in `tokio::time::timeout` to bound it.
    pub async fn wait_next(&mut self) -> Result<bool> {
        loop {
            if self.has_next().await? {
                return Ok(true);
            }
            if self.closed {
                return Ok(false);
            }
            if self.disabled && self.all_shards_processed() {
                info!(stream = %self.stream_arn, "stream disabled and drained");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Take the next buffered record.
    pub fn next_record(&mut self) -> Result<StreamRecord> {
        let raw = self.buffer.pop_front().ok_or(StreamError::NoMoreRecords)?;
        Ok(StreamRecord::from_raw(raw, self.keys_only)?)
    }

    /// Take the next buffered record and decode its image.
    pub fn next<D: DeserializeOwned>(&mut self) -> Result<(RecordType, D)> {
        let record = self.next_record()?;
        let item = codec::from_attribute_map(&record.image)
            .map_err(|e| StreamError::InvalidRecord(e.to_string()))?;
        Ok((record.record_type, item))
    }

    /// Every shard seen so far has been read to its end.
    fn all_shards_processed(&self) -> bool {
        self.described_shards
            .iter()
            .all(|id| self.processed_shards.contains(id))
    }

    fn close(&mut self, reason: &str) {
        self.closed = true;
        info!(stream = %self.stream_arn, reason, "stream closed");
    }

    /// One discovery-and-fetch pass over every description page.
    async fn poll_once(&mut self) -> Result<()> {
        loop {
            let input = DescribeStreamInput {
                stream_arn: self.stream_arn.clone(),
                exclusive_start_shard_id: self.last_shard_id.clone(),
            };
            let desc = match self.transport.describe_stream(input).await {
                Ok(desc) => desc,
                Err(e) if e.is_resource_not_found() => {
                    self.close("stream not found");
                    return Ok(());
                }
                Err(e) => return Err(Error::transport("describe stream")(e)),
            };

            if let Some(id) = &desc.last_evaluated_shard_id {
                self.last_shard_id = Some(id.clone());
            }
            self.disabled = desc.stream_status == StreamStatus::Disabled;
            self.keys_only = desc.stream_view_type == StreamViewType::KeysOnly;

            self.described_shards
                .extend(desc.shards.iter().map(|s| s.shard_id.clone()));
            let mut shards: Vec<Shard> = desc
                .shards
                .into_iter()
                .filter(|s| !self.processed_shards.contains(&s.shard_id))
                .map(Shard::from)
                .collect();
            shards.sort_by(|a, b| a.start.cmp(&b.start));
            debug!(
                stream = %self.stream_arn,
                shards = shards.len(),
                more = desc.last_evaluated_shard_id.is_some(),
                "discovered shards"
            );

            for shard in &shards {
                self.read_shard(shard).await?;
                if self.closed {
                    return Ok(());
                }
            }

            if desc.last_evaluated_shard_id.is_none() || !self.buffer.is_empty() {
                return Ok(());
            }
        }
    }

    /// Obtain an iterator for `shard`, resuming after the last seen record
    /// when it lies within the shard.
    async fn shard_iterator(&mut self, shard: &Shard) -> Result<Option<String>> {
        if let Some(last) = self.last_seq.as_ref().filter(|s| shard.contains(s)) {
            let input = GetShardIteratorInput {
                stream_arn: self.stream_arn.clone(),
                shard_id: shard.id.clone(),
                shard_iterator_type: ShardIteratorType::AfterSequenceNumber,
                sequence_number: Some(last.as_str().to_string()),
            };
            match self.transport.get_shard_iterator(input).await {
                Ok(out) if out.shard_iterator.is_some() => return Ok(out.shard_iterator),
                Ok(_) => {}
                Err(e) => {
                    debug!(shard = %shard.id, error = %e, "resume failed, reading from trim horizon");
                }
            }
        }

        let input = GetShardIteratorInput {
            stream_arn: self.stream_arn.clone(),
            shard_id: shard.id.clone(),
            shard_iterator_type: ShardIteratorType::TrimHorizon,
            sequence_number: None,
        };
        match self.transport.get_shard_iterator(input).await {
            Ok(out) => Ok(out.shard_iterator),
            Err(e) if e.is_resource_not_found() => {
                self.close("shard not found");
                Ok(None)
            }
            Err(e) => Err(Error::transport("get shard iterator")(e)),
        }
    }

    async fn read_shard(&mut self, shard: &Shard) -> Result<()> {
        let Some(mut iterator) = self.shard_iterator(shard).await? else {
            if !self.closed {
                self.processed_shards.insert(shard.id.clone());
            }
            return Ok(());
        };

        let mut refreshes = 0;
        loop {
            let input = GetRecordsInput {
                shard_iterator: iterator,
                limit: None,
            };
            let out = match self.transport.get_records(input).await {
                Ok(out) => out,
                Err(TransportError::ExpiredIterator(_)) if refreshes < self.max_iterator_refreshes => {
                    refreshes += 1;
                    warn!(shard = %shard.id, attempt = refreshes, "shard iterator expired, refreshing");
                    match self.shard_iterator(shard).await? {
                        Some(it) => {
                            iterator = it;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
                Err(e) if e.is_resource_not_found() => {
                    self.close("shard not found");
                    return Ok(());
                }
                Err(e) => return Err(Error::transport("get records")(e)),
            };

            let received = out.records.len();
            for raw in out.records {
                self.accept(shard, raw);
            }

            match out.next_shard_iterator {
                Some(next) => iterator = next,
                None => {
                    debug!(shard = %shard.id, "shard drained");
                    self.processed_shards.insert(shard.id.clone());
                    return Ok(());
                }
            }
            if received == 0 {
                return Ok(());
            }
        }
    }

    /// Buffer a record unless it is at or before the resume point.
    fn accept(&mut self, shard: &Shard, raw: RawRecord) {
        let seq = SequenceNumber(raw.sequence_number.clone());
        if let Some(last) = &self.last_seq {
            if shard.contains(last) && seq <= *last {
                debug!(shard = %shard.id, seq = %seq, "skipping already seen record");
                return;
            }
        }
        self.last_seq = Some(seq);
        self.buffer.push_back(raw);
    }
}
