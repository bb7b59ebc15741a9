//! # ferridyn-mapper
//!
//! A typed data-access layer for DynamoDB-style stores.
//!
//! Items are plain serde types. The mapper turns them into attribute maps,
//! works out their keys from an [`ItemSchema`], compiles condition
//! expressions with placeholders, pages through query and scan results,
//! retries unprocessed batch items, and follows table streams in sequence
//! order. The store itself sits behind the [`Transport`] trait;
//! [`SocketTransport`] speaks newline-delimited JSON over a Unix socket.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ferridyn_mapper::{Client, Item, ItemSchema, KeyDescriptor, SocketTransport};
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Track {
//!     album: String,
//!     no: i64,
//!     title: String,
//! }
//!
//! impl Item for Track {
//!     fn schema() -> Option<ItemSchema> {
//!         Some(ItemSchema::new(KeyDescriptor::hash_range("album", "no")))
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = SocketTransport::connect("/tmp/ferridyn.sock").await?;
//! let client = Client::new(transport);
//!
//! client
//!     .put("tracks", &Track { album: "Low".into(), no: 1, title: "Speed of Life".into() })
//!     .await?;
//!
//! let tracks: Vec<Track> = client
//!     .query("tracks")
//!     .hash_filter("album", "Low")
//!     .range_filter("no BETWEEN :lo AND :hi", &[json!(1), json!(5)])
//!     .run()
//!     .await?
//!     .collect()
//!     .await?;
//! # let _ = tracks;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod expression;
pub mod query;
pub mod schema;
pub mod stream;
pub mod transport;
pub mod types;

pub use batch::{BatchDelete, BatchGet, BatchPut};
pub use client::Client;
pub use config::ClientConfig;
pub use error::{
    BatchError, CodecError, Error, ExpressionError, ItemError, QueryError, Result, SchemaError,
    StreamError, TransportError,
};
pub use expression::{CompiledExpression, ExpressionCompiler};
pub use query::{Query, ResultIterator};
pub use schema::{Item, SchemaCache};
pub use stream::{RecordIterator, RecordType, SequenceNumber, StreamRecord};
pub use transport::{SocketTransport, TableAdmin, Transport};
pub use types::{AttributeMap, AttributeValue, IndexKind, ItemSchema, KeyDescriptor};
