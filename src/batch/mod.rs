//! Entity Group Transactions
//!
//! A `$batch` request is a `multipart/mixed` body holding either one changeset of
//! mutating sub-requests or a single bare `GET`:
//!
//! ```text
//! --batch_<token>
//! Content-Type: multipart/mixed; boundary=changeset_<token>
//!
//! --changeset_<token>
//! Content-Type: application/http
//! Content-Transfer-Encoding: binary
//!
//! PUT http://host/account/table(PartitionKey='p',RowKey='r') HTTP/1.1
//! If-Match: *
//!
//! {"Value":1}
//! --changeset_<token>--
//! --batch_<token>--
//! ```
//!
//! - [`BatchTransactionParser`]: envelope -> [`BatchTransactionContext`]
//! - [`BatchOperationDispatcher`]: validates every sub-operation, then applies them
//!   in one atomic storage call
//! - [`BatchResponseSerializer`]: outcomes -> `multipart/mixed` response

pub mod dispatcher;
pub mod parser;
pub mod serializer;

pub use dispatcher::{BatchOperationDispatcher, SubResponse};
pub use parser::BatchTransactionParser;
pub use serializer::BatchResponseSerializer;

use crate::entity::PARTITION_KEY;
use crate::protocol::context::Headers;
use crate::protocol::resource::Resource;

/// Maximum number of sub-requests in one changeset
pub const MAX_OPERATIONS: usize = 100;

/// Sub-request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerb {
    Get,
    Post,
    Put,
    Patch,
    Merge,
    Delete,
}

impl BatchVerb {
    pub fn parse(verb: &str) -> Option<Self> {
        match verb {
            "GET" => Some(BatchVerb::Get),
            "POST" => Some(BatchVerb::Post),
            "PUT" => Some(BatchVerb::Put),
            "PATCH" => Some(BatchVerb::Patch),
            "MERGE" => Some(BatchVerb::Merge),
            "DELETE" => Some(BatchVerb::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchVerb::Get => "GET",
            BatchVerb::Post => "POST",
            BatchVerb::Put => "PUT",
            BatchVerb::Patch => "PATCH",
            BatchVerb::Merge => "MERGE",
            BatchVerb::Delete => "DELETE",
        }
    }
}

/// What a sub-request does.
///
/// | verb           | target                  | kind       |
/// |----------------|-------------------------|------------|
/// | `POST`         | `table` / `table()`     | `Insert`   |
/// | `PUT`          | `table(PK=..,RK=..)`    | `Upsert`   |
/// | `PATCH`/`MERGE`| `table(PK=..,RK=..)`    | `Merge`    |
/// | `DELETE`       | `table(PK=..,RK=..)`    | `Delete`   |
/// | `GET`          | `table(PK=..,RK=..)`    | `Retrieve` |
///
/// `Upsert` and `Merge` become conditional updates when `If-Match` is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Upsert,
    Merge,
    Delete,
    Retrieve,
}

impl OperationKind {
    pub fn select(verb: BatchVerb, resource: &Resource) -> Option<Self> {
        match (verb, resource) {
            (BatchVerb::Post, Resource::Entities { .. }) => Some(OperationKind::Insert),
            (BatchVerb::Put, Resource::Entity { .. }) => Some(OperationKind::Upsert),
            (BatchVerb::Patch | BatchVerb::Merge, Resource::Entity { .. }) => {
                Some(OperationKind::Merge)
            }
            (BatchVerb::Delete, Resource::Entity { .. }) => Some(OperationKind::Delete),
            (BatchVerb::Get, Resource::Entity { .. }) => Some(OperationKind::Retrieve),
            _ => None,
        }
    }

    pub fn is_mutation(self) -> bool {
        self != OperationKind::Retrieve
    }
}

/// One parsed sub-request. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperation {
    pub verb: BatchVerb,
    /// Request target as sent (usually an absolute URL)
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub content_id: Option<String>,
    pub kind: OperationKind,
    pub resource: Resource,
    /// Query string of the target
    pub query: Option<String>,
}

impl BatchOperation {
    /// Table addressed by the sub-request
    pub fn table(&self) -> &str {
        self.resource.table().unwrap_or_default()
    }

    /// Partition key from the target, or from the body for inserts.
    pub fn partition_key(&self) -> Option<String> {
        match &self.resource {
            Resource::Entity { partition_key, .. } => Some(partition_key.clone()),
            _ => serde_json::from_slice::<serde_json::Value>(&self.body)
                .ok()?
                .get(PARTITION_KEY)?
                .as_str()
                .map(str::to_string),
        }
    }
}

/// A parsed `$batch` request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTransactionContext {
    pub operations: Vec<BatchOperation>,
    /// The partition key every sub-request shares
    pub partition_key: Option<String>,
    /// The table every sub-request addresses
    pub table: Option<String>,
    pub batch_boundary: String,
    /// `None` for a bare retrieve
    pub changeset_boundary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> Resource {
        Resource::Entity {
            table: "t".into(),
            partition_key: "p".into(),
            row_key: "r".into(),
        }
    }

    #[test]
    fn test_decision_table() {
        let entities = Resource::Entities { table: "t".into() };
        assert_eq!(
            OperationKind::select(BatchVerb::Post, &entities),
            Some(OperationKind::Insert)
        );
        assert_eq!(
            OperationKind::select(BatchVerb::Put, &entity()),
            Some(OperationKind::Upsert)
        );
        assert_eq!(
            OperationKind::select(BatchVerb::Merge, &entity()),
            Some(OperationKind::Merge)
        );
        assert_eq!(
            OperationKind::select(BatchVerb::Patch, &entity()),
            Some(OperationKind::Merge)
        );
        assert_eq!(
            OperationKind::select(BatchVerb::Get, &entity()),
            Some(OperationKind::Retrieve)
        );
        assert_eq!(OperationKind::select(BatchVerb::Post, &entity()), None);
        assert_eq!(OperationKind::select(BatchVerb::Get, &Resource::Tables), None);
    }

    #[test]
    fn test_verb_round_trip() {
        for verb in ["GET", "POST", "PUT", "PATCH", "MERGE", "DELETE"] {
            assert_eq!(BatchVerb::parse(verb).map(BatchVerb::as_str), Some(verb));
        }
        assert_eq!(BatchVerb::parse("HEAD"), None);
    }
}
