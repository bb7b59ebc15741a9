//! JSON-lines transport over a Unix socket.
//!
//! Each call writes one request line tagged with `"op"` and reads one response
//! line. A response is either `{"ok": true, ...}` or
//! `{"error": "<code>", "message": "<text>"}`.
//!
//! The write and the matching read run on a spawned task, so a caller that
//! drops its future mid-call never leaves a stale response for the next one.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use super::protocol::*;
use super::{TableAdmin, Transport};
use crate::error::TransportError;

const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
const EXPIRED_ITERATOR: &str = "ExpiredIteratorException";

type Result<T> = std::result::Result<T, TransportError>;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    line_buf: String,
}

impl Connection {
    /// Write one request line and read its response line.
    async fn round_trip(&mut self, data: &[u8]) -> Result<Value> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;

        self.line_buf.clear();
        let n = self.reader.read_line(&mut self.line_buf).await?;
        if n == 0 {
            return Err(TransportError::Disconnected);
        }
        trace!(bytes = n, "response line received");

        serde_json::from_str(self.line_buf.trim()).map_err(TransportError::Serialization)
    }
}

/// A [`Transport`] speaking newline-delimited JSON over a Unix socket.
///
/// Request/response pairs are serialized through an async mutex, so one
/// transport can be shared by concurrent tasks.
pub struct SocketTransport {
    conn: Arc<Mutex<Connection>>,
}

impl SocketTransport {
    /// Connect to a server at the given Unix socket path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: BufWriter::new(write_half),
                line_buf: String::new(),
            })),
        })
    }

    async fn send_request(&self, req: &Request<'_>) -> Result<Value> {
        let mut data = serde_json::to_vec(req).map_err(TransportError::Serialization)?;
        data.push(b'\n');

        let conn = Arc::clone(&self.conn);
        let exchange = tokio::spawn(async move {
            let mut conn = conn.lock_owned().await;
            conn.round_trip(&data).await
        });
        let resp = exchange
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;
        check_error(&resp)?;
        Ok(resp)
    }

    async fn call<O: DeserializeOwned>(&self, req: Request<'_>) -> Result<O> {
        let resp = self.send_request(&req).await?;
        serde_json::from_value(resp).map_err(TransportError::Serialization)
    }
}

fn check_error(resp: &Value) -> Result<()> {
    if !resp.is_object() {
        return Err(TransportError::Protocol(format!(
            "expected a JSON object, got: {resp}"
        )));
    }
    if resp.get("error").is_none() {
        return Ok(());
    }

    let err: ErrorResponse =
        serde_json::from_value(resp.clone()).map_err(TransportError::Serialization)?;
    Err(match err.error.as_str() {
        RESOURCE_NOT_FOUND => TransportError::ResourceNotFound(err.message),
        EXPIRED_ITERATOR => TransportError::ExpiredIterator(err.message),
        _ => TransportError::Service {
            code: err.error,
            message: err.message,
        },
    })
}

impl Transport for SocketTransport {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput> {
        self.call(Request::GetItem(&input)).await
    }

    async fn put_item(&self, input: PutItemInput) -> Result<()> {
        self.send_request(&Request::PutItem(&input)).await?;
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<()> {
        self.send_request(&Request::DeleteItem(&input)).await?;
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<PageOutput> {
        self.call(Request::Query(&input)).await
    }

    async fn scan(&self, input: ScanInput) -> Result<PageOutput> {
        self.call(Request::Scan(&input)).await
    }

    async fn batch_get_item(&self, input: BatchGetInput) -> Result<BatchGetOutput> {
        self.call(Request::BatchGetItem(&input)).await
    }

    async fn batch_write_item(&self, input: BatchWriteInput) -> Result<BatchWriteOutput> {
        self.call(Request::BatchWriteItem(&input)).await
    }

    async fn describe_stream(&self, input: DescribeStreamInput) -> Result<StreamDescription> {
        self.call(Request::DescribeStream(&input)).await
    }

    async fn get_shard_iterator(
        &self,
        input: GetShardIteratorInput,
    ) -> Result<GetShardIteratorOutput> {
        self.call(Request::GetShardIterator(&input)).await
    }

    async fn get_records(&self, input: GetRecordsInput) -> Result<GetRecordsOutput> {
        self.call(Request::GetRecords(&input)).await
    }
}

impl TableAdmin for SocketTransport {
    async fn describe_table(&self, table: &str) -> Result<TableDescription> {
        self.call(Request::DescribeTable { table }).await
    }
}
