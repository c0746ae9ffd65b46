//! Storage Module
//!
//! The storage collaborator behind the table service:
//! - [`TableStore`]: the narrow interface the handler and batch dispatcher consume
//! - [`MemoryTableStore`]: in-memory engine with per-account table namespaces
//! - [`Filter`]: `$filter` expressions evaluated against entities and tables
//!
//! ## Concurrency Model
//!
//! Every mutation runs its `If-Match` check and its write under one lock, giving
//! compare-and-swap semantics keyed on the ETag. [`TableStore::apply_transaction`]
//! applies a whole entity group transaction atomically: every mutation is checked
//! against the staged state of the previous ones, and nothing is written unless all
//! of them succeed.
//!
//! ## Paging
//!
//! Tables are listed in name order, entities in (PartitionKey, RowKey) order. A page
//! that stops early reports the first key it did not return as the continuation.

pub mod error;
pub mod filter;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use filter::Filter;
pub use memory::MemoryTableStore;

use crate::entity::{Entity, NewEntity};

/// A table as the service sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRecord {
    pub account: String,
    /// Name with the casing it was created with
    pub name: String,
}

/// Table listing options.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    /// Page size; 0 returns an empty page with no continuation
    pub top: usize,
    pub filter: Option<Filter>,
    /// Resume from this table name (inclusive)
    pub next_table_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TablePage {
    pub tables: Vec<TableRecord>,
    pub next_table_name: Option<String>,
}

/// Entity listing options.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    /// Page size; 0 returns an empty page with no continuation
    pub top: usize,
    pub filter: Option<Filter>,
    /// Resume from this key (inclusive)
    pub next_partition_key: Option<String>,
    pub next_row_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityPage {
    pub entities: Vec<Entity>,
    pub next_partition_key: Option<String>,
    pub next_row_key: Option<String>,
}

/// One entity write inside a transaction.
///
/// `if_match: None` on replace/merge means upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMutation {
    Insert(NewEntity),
    Replace {
        entity: NewEntity,
        if_match: Option<String>,
    },
    Merge {
        entity: NewEntity,
        if_match: Option<String>,
    },
    Delete {
        partition_key: String,
        row_key: String,
        if_match: Option<String>,
    },
}

/// Result of one applied mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Written(Entity),
    Deleted,
}

/// Storage collaborator interface
pub trait TableStore: Send + Sync {
    /// Create a table; names collide case-insensitively within an account.
    fn create_table(&self, account: &str, name: &str) -> StorageResult<TableRecord>;

    fn delete_table(&self, account: &str, name: &str) -> StorageResult<()>;

    /// Look up a table by case-insensitive name
    fn get_table(&self, account: &str, name: &str) -> StorageResult<TableRecord>;

    fn query_tables(&self, account: &str, query: &TableQuery) -> StorageResult<TablePage>;

    /// Insert a new entity; fails if the key is taken.
    fn insert_entity(&self, account: &str, table: &str, entity: NewEntity)
        -> StorageResult<Entity>;

    /// Replace the entity's properties (upsert when `if_match` is `None`).
    fn insert_or_update_entity(
        &self,
        account: &str,
        table: &str,
        entity: NewEntity,
        if_match: Option<&str>,
    ) -> StorageResult<Entity>;

    /// Merge properties into the entity (upsert when `if_match` is `None`).
    fn insert_or_merge_entity(
        &self,
        account: &str,
        table: &str,
        entity: NewEntity,
        if_match: Option<&str>,
    ) -> StorageResult<Entity>;

    fn delete_entity(
        &self,
        account: &str,
        table: &str,
        partition_key: &str,
        row_key: &str,
        if_match: Option<&str>,
    ) -> StorageResult<()>;

    fn query_entities(
        &self,
        account: &str,
        table: &str,
        query: &EntityQuery,
    ) -> StorageResult<EntityPage>;

    /// `Ok(None)` when the table exists but the entity does not
    fn get_entity(
        &self,
        account: &str,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<Entity>>;

    /// Apply mutations in order, all or nothing, stamped with one timestamp.
    ///
    /// On failure returns [`StorageError::TransactionAborted`] carrying the index of
    /// the failing mutation.
    fn apply_transaction(
        &self,
        account: &str,
        table: &str,
        mutations: Vec<EntityMutation>,
    ) -> StorageResult<Vec<MutationOutcome>>;

    /// Number of tables across all accounts
    fn table_count(&self) -> usize;
}
