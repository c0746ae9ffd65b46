//! In-memory table store.
//!
//! Uses `parking_lot::RwLock` (no poisoning). Reads share the lock; every write,
//! including the `If-Match` comparison that guards it, holds the write lock.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{
    EntityMutation, EntityPage, EntityQuery, MutationOutcome, StorageError, StorageResult,
    TablePage, TableQuery, TableRecord, TableStore,
};
use crate::concurrency::{check_precondition, new_etag, TimestampClock, WriteKind};
use crate::entity::{Entity, NewEntity, Timestamp};
use crate::value::EdmValue;

/// (PartitionKey, RowKey)
type EntityKey = (String, String);

/// (account, lowercase table name)
type TableKey = (String, String);

#[derive(Debug, Default)]
struct TableData {
    name: String,
    entities: BTreeMap<EntityKey, Entity>,
}

/// In-memory [`TableStore`].
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: RwLock<BTreeMap<TableKey, TableData>>,
    clock: TimestampClock,
    /// 0 = unlimited
    max_tables: usize,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses to create more than `max_tables` tables (0 = unlimited).
    pub fn with_max_tables(max_tables: usize) -> Self {
        Self {
            max_tables,
            ..Self::default()
        }
    }

    fn table_key(account: &str, name: &str) -> TableKey {
        (account.to_string(), name.to_lowercase())
    }
}

/// Entity slots a mutation reads and writes: the live map, or a staged overlay.
trait EntitySlots {
    fn current(&self, key: &EntityKey) -> Option<&Entity>;
    fn put(&mut self, entity: Entity);
    fn remove(&mut self, key: &EntityKey);
}

impl EntitySlots for BTreeMap<EntityKey, Entity> {
    fn current(&self, key: &EntityKey) -> Option<&Entity> {
        self.get(key)
    }

    fn put(&mut self, entity: Entity) {
        self.insert(entity.key(), entity);
    }

    fn remove(&mut self, key: &EntityKey) {
        BTreeMap::remove(self, key);
    }
}

/// Copy-on-write view over a table for a transaction. `None` in the overlay marks
/// a staged delete.
struct Staged<'a> {
    base: &'a BTreeMap<EntityKey, Entity>,
    overlay: BTreeMap<EntityKey, Option<Entity>>,
}

impl<'a> Staged<'a> {
    fn new(base: &'a BTreeMap<EntityKey, Entity>) -> Self {
        Self {
            base,
            overlay: BTreeMap::new(),
        }
    }
}

impl EntitySlots for Staged<'_> {
    fn current(&self, key: &EntityKey) -> Option<&Entity> {
        match self.overlay.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(key),
        }
    }

    fn put(&mut self, entity: Entity) {
        self.overlay.insert(entity.key(), Some(entity));
    }

    fn remove(&mut self, key: &EntityKey) {
        self.overlay.insert(key.clone(), None);
    }
}

fn stamp(entity: NewEntity, timestamp: Timestamp) -> Entity {
    entity.into_entity(timestamp, new_etag(timestamp))
}

/// Apply one mutation to `slots`. Shared by single writes and transactions.
fn apply_mutation<S: EntitySlots>(
    slots: &mut S,
    mutation: EntityMutation,
    timestamp: Timestamp,
) -> StorageResult<MutationOutcome> {
    match mutation {
        EntityMutation::Insert(entity) => {
            let key = (entity.partition_key.clone(), entity.row_key.clone());
            if slots.current(&key).is_some() {
                return Err(StorageError::EntityAlreadyExists(key.0, key.1));
            }
            let stored = stamp(entity, timestamp);
            slots.put(stored.clone());
            Ok(MutationOutcome::Written(stored))
        }
        EntityMutation::Replace { entity, if_match } => {
            let key = (entity.partition_key.clone(), entity.row_key.clone());
            let stored_etag = slots.current(&key).map(|e| e.etag.as_str());
            check_precondition(if_match.as_deref(), stored_etag, WriteKind::Replace)
                .map_err(|e| StorageError::from_precondition(e, &key.0, &key.1))?;
            let stored = stamp(entity, timestamp);
            slots.put(stored.clone());
            Ok(MutationOutcome::Written(stored))
        }
        EntityMutation::Merge { entity, if_match } => {
            let key = (entity.partition_key.clone(), entity.row_key.clone());
            let existing = slots.current(&key);
            check_precondition(
                if_match.as_deref(),
                existing.map(|e| e.etag.as_str()),
                WriteKind::Merge,
            )
            .map_err(|e| StorageError::from_precondition(e, &key.0, &key.1))?;
            let merged = match existing {
                Some(current) => {
                    let mut properties = current.properties.clone();
                    properties.extend(entity.properties);
                    NewEntity {
                        properties,
                        ..entity_keys(&key)
                    }
                }
                None => entity,
            };
            let stored = stamp(merged, timestamp);
            slots.put(stored.clone());
            Ok(MutationOutcome::Written(stored))
        }
        EntityMutation::Delete {
            partition_key,
            row_key,
            if_match,
        } => {
            let key = (partition_key, row_key);
            let stored_etag = slots.current(&key).map(|e| e.etag.as_str());
            check_precondition(if_match.as_deref(), stored_etag, WriteKind::Delete)
                .map_err(|e| StorageError::from_precondition(e, &key.0, &key.1))?;
            slots.remove(&key);
            Ok(MutationOutcome::Deleted)
        }
    }
}

fn entity_keys(key: &EntityKey) -> NewEntity {
    NewEntity {
        partition_key: key.0.clone(),
        row_key: key.1.clone(),
        properties: Default::default(),
    }
}

impl MemoryTableStore {
    fn write_one(
        &self,
        account: &str,
        table: &str,
        mutation: EntityMutation,
    ) -> StorageResult<MutationOutcome> {
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(&Self::table_key(account, table))
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        apply_mutation(&mut data.entities, mutation, self.clock.next())
    }

    fn written(outcome: MutationOutcome) -> Entity {
        match outcome {
            MutationOutcome::Written(entity) => entity,
            MutationOutcome::Deleted => unreachable!("write mutation reported a delete"),
        }
    }
}

impl TableStore for MemoryTableStore {
    fn create_table(&self, account: &str, name: &str) -> StorageResult<TableRecord> {
        let mut tables = self.tables.write();
        let key = Self::table_key(account, name);
        if tables.contains_key(&key) {
            return Err(StorageError::TableAlreadyExists(name.to_string()));
        }
        if self.max_tables > 0 && tables.len() >= self.max_tables {
            return Err(StorageError::TableLimitReached(self.max_tables));
        }
        tables.insert(
            key,
            TableData {
                name: name.to_string(),
                entities: BTreeMap::new(),
            },
        );
        tracing::debug!(account, table = name, "table_created");
        Ok(TableRecord {
            account: account.to_string(),
            name: name.to_string(),
        })
    }

    fn delete_table(&self, account: &str, name: &str) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables
            .remove(&Self::table_key(account, name))
            .map(|_| tracing::debug!(account, table = name, "table_deleted"))
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    fn get_table(&self, account: &str, name: &str) -> StorageResult<TableRecord> {
        let tables = self.tables.read();
        tables
            .get(&Self::table_key(account, name))
            .map(|data| TableRecord {
                account: account.to_string(),
                name: data.name.clone(),
            })
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    fn query_tables(&self, account: &str, query: &TableQuery) -> StorageResult<TablePage> {
        if query.top == 0 {
            return Ok(TablePage::default());
        }
        let tables = self.tables.read();
        let start = query
            .next_table_name
            .as_deref()
            .map(|n| n.to_lowercase())
            .unwrap_or_default();

        let mut matching = tables
            .range(Self::table_key(account, &start)..)
            .take_while(|((acct, _), _)| acct == account)
            .filter(|(_, data)| {
                query.filter.as_ref().map_or(true, |f| {
                    f.matches(&|prop: &str| {
                        (prop == "TableName").then(|| EdmValue::string(&data.name))
                    })
                })
            })
            .map(|(_, data)| TableRecord {
                account: account.to_string(),
                name: data.name.clone(),
            });

        let page: Vec<TableRecord> = matching.by_ref().take(query.top).collect();
        let next_table_name = matching.next().map(|t| t.name);
        Ok(TablePage {
            tables: page,
            next_table_name,
        })
    }

    fn insert_entity(
        &self,
        account: &str,
        table: &str,
        entity: NewEntity,
    ) -> StorageResult<Entity> {
        self.write_one(account, table, EntityMutation::Insert(entity))
            .map(Self::written)
    }

    fn insert_or_update_entity(
        &self,
        account: &str,
        table: &str,
        entity: NewEntity,
        if_match: Option<&str>,
    ) -> StorageResult<Entity> {
        let mutation = EntityMutation::Replace {
            entity,
            if_match: if_match.map(str::to_string),
        };
        self.write_one(account, table, mutation).map(Self::written)
    }

    fn insert_or_merge_entity(
        &self,
        account: &str,
        table: &str,
        entity: NewEntity,
        if_match: Option<&str>,
    ) -> StorageResult<Entity> {
        let mutation = EntityMutation::Merge {
            entity,
            if_match: if_match.map(str::to_string),
        };
        self.write_one(account, table, mutation).map(Self::written)
    }

    fn delete_entity(
        &self,
        account: &str,
        table: &str,
        partition_key: &str,
        row_key: &str,
        if_match: Option<&str>,
    ) -> StorageResult<()> {
        let mutation = EntityMutation::Delete {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            if_match: if_match.map(str::to_string),
        };
        self.write_one(account, table, mutation).map(|_| ())
    }

    fn query_entities(
        &self,
        account: &str,
        table: &str,
        query: &EntityQuery,
    ) -> StorageResult<EntityPage> {
        let tables = self.tables.read();
        let data = tables
            .get(&Self::table_key(account, table))
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        if query.top == 0 {
            return Ok(EntityPage::default());
        }

        let start = (
            query.next_partition_key.clone().unwrap_or_default(),
            query.next_row_key.clone().unwrap_or_default(),
        );
        let mut matching = data.entities.range(start..).map(|(_, e)| e).filter(|e| {
            query
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&|prop: &str| e.property(prop)))
        });

        let entities: Vec<Entity> = matching.by_ref().take(query.top).cloned().collect();
        let next = matching.next();
        Ok(EntityPage {
            entities,
            next_partition_key: next.map(|e| e.partition_key.clone()),
            next_row_key: next.map(|e| e.row_key.clone()),
        })
    }

    fn get_entity(
        &self,
        account: &str,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> StorageResult<Option<Entity>> {
        let tables = self.tables.read();
        let data = tables
            .get(&Self::table_key(account, table))
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        Ok(data
            .entities
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned())
    }

    fn apply_transaction(
        &self,
        account: &str,
        table: &str,
        mutations: Vec<EntityMutation>,
    ) -> StorageResult<Vec<MutationOutcome>> {
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(&Self::table_key(account, table))
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        let timestamp = self.clock.next();

        let mut staged = Staged::new(&data.entities);
        let mut outcomes = Vec::with_capacity(mutations.len());
        for (index, mutation) in mutations.into_iter().enumerate() {
            match apply_mutation(&mut staged, mutation, timestamp) {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    tracing::debug!(account, table, index, error = %source, "transaction_aborted");
                    return Err(StorageError::TransactionAborted {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        let overlay = staged.overlay;
        for (key, slot) in overlay {
            match slot {
                Some(entity) => {
                    data.entities.insert(key, entity);
                }
                None => {
                    data.entities.remove(&key);
                }
            }
        }
        Ok(outcomes)
    }

    fn table_count(&self) -> usize {
        self.tables.read().len()
    }
}
