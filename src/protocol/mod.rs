//! Table Service Protocol
//!
//! Request handling between the HTTP listener and storage.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                 Table Service Protocol                      |
//! +-------------------------------------------------------------+
//! |  HTTP Endpoints:                                            |
//! |    - /health, /live, /ready: probes                         |
//! |    - /metrics: server statistics                            |
//! |    - /{account}/{resource}: tables, entities, $batch        |
//! +-------------------------------------------------------------+
//! |  Payloads: OData JSON (nometadata/minimal/full)             |
//! |  Batches:  multipart/mixed with changesets                  |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Module Structure
//!
//! - `context` - Request/response abstraction (headers, query options, verbosity)
//! - `error` - Error taxonomy and OData error bodies
//! - `resource` - Resource addressing (`Tables('t')`, `t(PartitionKey=..,RowKey=..)`)
//! - `handler` - Façade implementing every operation
//! - `rest` - axum router and handlers

pub mod context;
pub mod error;
pub mod handler;
pub mod resource;
pub mod rest;

pub use context::{Headers, QueryOptions, RequestContext, TableResponse};
pub use error::{TableError, TableResult};
pub use handler::{HandlerStats, TableHandler};
pub use resource::Resource;

/// Default HTTP server port
pub const DEFAULT_PORT: u16 = 10002;

/// Default account of the development storage endpoint
pub const DEFAULT_ACCOUNT: &str = "devstoreaccount1";
