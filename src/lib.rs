//! # Tablestore
//!
//! A table storage service emulator: schemaless entities addressed by
//! `(PartitionKey, RowKey)`, OData JSON payloads, optimistic concurrency through
//! ETags and atomic entity group transactions submitted as `multipart/mixed`
//! batches.
//!
//! ## Request Pipeline
//!
//! ```text
//! HTTP request (axum)
//!     ↓
//! [protocol::rest]             → RequestContext + Resource
//!     ↓
//! [protocol::TableHandler]     → operation
//!     ├── [entity::normalize]  → typed property bag
//!     ├── [concurrency]        → If-Match precondition
//!     ├── [batch]              → parse → dispatch → serialize
//!     ↓
//! [storage::TableStore]        → tables and entities
//!     ↓
//! [odata]                      → annotated JSON response
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tablestore::{Config, TableHandler};
//! use tablestore::protocol::rest;
//!
//! let config = Config::load()?;
//! let handler = Arc::new(TableHandler::from_config(&config));
//! rest::start_http_server(handler, &config.http).await?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | EDM types and typed property values |
//! | `entity` | Entities, keys, timestamps, request-body normalization |
//! | `odata` | Metadata verbosity and `odata.*` annotations |
//! | `concurrency` | ETags, If-Match classification, timestamp clock |
//! | `storage` | `TableStore` trait, in-memory store, `$filter` |
//! | `batch` | Entity group transactions |
//! | `protocol` | Request handling façade and HTTP server |
//! | `config` | Layered configuration |

pub mod batch;
pub mod concurrency;
pub mod config;
pub mod entity;
pub mod odata;
pub mod protocol;
pub mod storage;
pub mod value;

pub use config::Config;
pub use entity::{Entity, NewEntity, PropertyBag, Timestamp};
pub use protocol::{TableError, TableHandler, TableResult};
pub use storage::{MemoryTableStore, TableStore};
pub use value::{EdmType, EdmValue};
