//! The network seam: every store call the client makes goes through [`Transport`].

pub mod protocol;
mod socket;

use std::future::Future;

pub use protocol::*;
pub use socket::SocketTransport;

use crate::error::TransportError;

/// Data-plane calls against the store.
///
/// Implementations report missing tables and streams as
/// [`TransportError::ResourceNotFound`] and stale shard iterators as
/// [`TransportError::ExpiredIterator`]; the stream consumer relies on both.
pub trait Transport: Send + Sync {
    fn get_item(
        &self,
        input: GetItemInput,
    ) -> impl Future<Output = Result<GetItemOutput, TransportError>> + Send;

    fn put_item(&self, input: PutItemInput)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn delete_item(
        &self,
        input: DeleteItemInput,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn query(
        &self,
        input: QueryInput,
    ) -> impl Future<Output = Result<PageOutput, TransportError>> + Send;

    fn scan(&self, input: ScanInput)
    -> impl Future<Output = Result<PageOutput, TransportError>> + Send;

    fn batch_get_item(
        &self,
        input: BatchGetInput,
    ) -> impl Future<Output = Result<BatchGetOutput, TransportError>> + Send;

    fn batch_write_item(
        &self,
        input: BatchWriteInput,
    ) -> impl Future<Output = Result<BatchWriteOutput, TransportError>> + Send;

    fn describe_stream(
        &self,
        input: DescribeStreamInput,
    ) -> impl Future<Output = Result<StreamDescription, TransportError>> + Send;

    fn get_shard_iterator(
        &self,
        input: GetShardIteratorInput,
    ) -> impl Future<Output = Result<GetShardIteratorOutput, TransportError>> + Send;

    fn get_records(
        &self,
        input: GetRecordsInput,
    ) -> impl Future<Output = Result<GetRecordsOutput, TransportError>> + Send;
}

/// Control-plane lookup needed to find a table's stream.
pub trait TableAdmin: Send + Sync {
    fn describe_table(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<TableDescription, TransportError>> + Send;
}
