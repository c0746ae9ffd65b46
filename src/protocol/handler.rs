//! Table service façade
//!
//! Entry point for single operations and entity group transactions, used by the REST
//! API. Runs the normalizer, the concurrency guard and the annotator around one call
//! into the [`TableStore`]. Counters are `AtomicU64` (lock-free).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::http::StatusCode;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::context::{
    RequestContext, TableResponse, PREFER_RETURN_CONTENT, PREFER_RETURN_NO_CONTENT,
};
use super::error::{TableError, TableResult};
use super::resource::Resource;
use crate::batch::{BatchOperationDispatcher, BatchResponseSerializer, BatchTransactionParser};
use crate::concurrency::classify;
use crate::entity::{normalize, Entity, NewEntity, PARTITION_KEY, ROW_KEY};
use crate::odata::{self, TableAnnotations, Verbosity};
use crate::storage::{
    EntityQuery, Filter, MemoryTableStore, TableQuery, TableStore,
};
use crate::Config;

/// RFC 1123 date as used by the `Date` header
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Table names: 3-63 alphanumeric characters, starting with a letter.
const TABLE_NAME_PATTERN: &str = "^[A-Za-z][A-Za-z0-9]{2,62}$";

fn table_name_regex() -> TableResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(TABLE_NAME_PATTERN))
        .as_ref()
        .map_err(|e| TableError::Internal {
            message: format!("table name pattern: {e}"),
        })
}

/// Validate a table name for creation.
pub fn validate_table_name(name: &str) -> TableResult<()> {
    if name.is_empty() {
        return Err(TableError::TableNameEmpty);
    }
    if name.eq_ignore_ascii_case("tables") {
        return Err(TableError::invalid_input(format!(
            "'{name}' is a reserved table name"
        )));
    }
    if !table_name_regex()?.is_match(name) {
        return Err(TableError::invalid_input(format!(
            "table name '{name}' must be 3-63 alphanumeric characters starting with a letter"
        )));
    }
    Ok(())
}

/// Point-in-time service statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    pub requests: u64,
    pub batches: u64,
    pub errors: u64,
    pub tables: usize,
    pub uptime_secs: u64,
}

/// Thread-safe table service shared by all HTTP handlers.
pub struct TableHandler {
    store: Arc<dyn TableStore>,
    max_page_size: usize,
    start_time: Instant,
    request_count: AtomicU64,
    batch_count: AtomicU64,
    error_count: AtomicU64,
}

impl TableHandler {
    /// Create a handler over the given store; `max_page_size` caps `$top`.
    pub fn new(store: Arc<dyn TableStore>, max_page_size: usize) -> Self {
        Self {
            store,
            max_page_size: max_page_size.max(1),
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            batch_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Create a handler with an in-memory store from configuration.
    pub fn from_config(config: &Config) -> Self {
        let store = MemoryTableStore::with_max_tables(config.storage.max_tables);
        Self::new(Arc::new(store), config.storage.max_page_size)
    }

    pub fn store(&self) -> &dyn TableStore {
        self.store.as_ref()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            requests: self.request_count.load(Ordering::Relaxed),
            batches: self.batch_count.load(Ordering::Relaxed),
            errors: self.error_count.load(Ordering::Relaxed),
            tables: self.store.table_count(),
            uptime_secs: self.uptime_seconds(),
        }
    }

    /// Handle one request and render failures as OData error responses.
    ///
    /// Every response carries `x-ms-request-id`, `x-ms-version` and `Date`, plus
    /// `x-ms-client-request-id` when the client sent one.
    pub fn handle(
        &self,
        method: &str,
        resource: &Resource,
        ctx: &RequestContext,
        body: &[u8],
    ) -> TableResponse {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let response = match self.route(method, resource, ctx, body) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(
                    method,
                    code = e.code(),
                    status = e.status().as_u16(),
                    error = %e,
                    "table_request_failed"
                );
                self.error_response(ctx, &e, None)
            }
        };
        Self::with_common_headers(ctx, response)
    }

    /// Error response for a request rejected before it reached an operation
    /// (unparseable path or query).
    pub fn reject(&self, ctx: &RequestContext, error: &TableError) -> TableResponse {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(code = error.code(), error = %error, "table_request_rejected");
        Self::with_common_headers(ctx, self.error_response(ctx, error, None))
    }

    fn with_common_headers(ctx: &RequestContext, response: TableResponse) -> TableResponse {
        let mut response = response
            .header("x-ms-request-id", ctx.request_id.clone())
            .header("x-ms-version", ctx.service_version())
            .header("Date", chrono::Utc::now().format(HTTP_DATE_FORMAT).to_string());
        if let Some(client_id) = ctx.client_request_id() {
            response = response.header("x-ms-client-request-id", client_id);
        }
        response
    }

    /// OData error response, optionally for batch sub-request `index`.
    pub(crate) fn error_response(
        &self,
        ctx: &RequestContext,
        error: &TableError,
        index: Option<usize>,
    ) -> TableResponse {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let content_type = ctx.verbosity().unwrap_or_default().content_type();
        TableResponse::new(error.status()).json(
            content_type,
            error.odata_body(&ctx.request_id, index).to_string(),
        )
    }

    fn route(
        &self,
        method: &str,
        resource: &Resource,
        ctx: &RequestContext,
        body: &[u8],
    ) -> TableResult<TableResponse> {
        let method = method.to_ascii_uppercase();
        let not_allowed = || TableError::MethodNotAllowed {
            method: method.clone(),
            resource: format!("{resource:?}"),
        };

        match resource {
            Resource::Tables => match method.as_str() {
                "POST" => self.create_table(ctx, body),
                "GET" => self.query_tables(ctx),
                _ => Err(not_allowed()),
            },
            Resource::Table(name) => match method.as_str() {
                "DELETE" => self.delete_table(ctx, name),
                _ => Err(not_allowed()),
            },
            Resource::Batch => match method.as_str() {
                "POST" => self.batch(ctx, body),
                _ => Err(not_allowed()),
            },
            Resource::Entities { table } => {
                if ctx.query.comp.as_deref() == Some("acl") {
                    return match method.as_str() {
                        "GET" | "HEAD" => self.get_access_policy(ctx, table),
                        "PUT" => self.set_access_policy(ctx, table),
                        _ => Err(not_allowed()),
                    };
                }
                match method.as_str() {
                    "POST" => self.insert_entity(ctx, table, body),
                    "GET" => self.query_entities(ctx, table),
                    _ => Err(not_allowed()),
                }
            }
            Resource::Entity {
                table,
                partition_key,
                row_key,
            } => match method.as_str() {
                "GET" => self.query_entity(ctx, table, partition_key, row_key),
                "PUT" => self.update_entity(ctx, table, partition_key, row_key, body),
                "PATCH" | "MERGE" => self.merge_entity(ctx, table, partition_key, row_key, body),
                "DELETE" => self.delete_entity(ctx, table, partition_key, row_key),
                _ => Err(not_allowed()),
            },
        }
    }

    // Table Operations

    pub fn create_table(&self, ctx: &RequestContext, body: &[u8]) -> TableResult<TableResponse> {
        let verbosity = ctx.verbosity()?;
        let name = match parse_object(body)? {
            Some(object) => match object.get("TableName") {
                Some(Value::String(name)) => name.clone(),
                Some(Value::Null) | None => return Err(TableError::TableNameEmpty),
                Some(_) => return Err(TableError::invalid_input("TableName must be a string")),
            },
            None => return Err(TableError::TableNameEmpty),
        };
        validate_table_name(&name)?;

        let record = self.store.create_table(&ctx.account, &name)?;
        tracing::info!(account = %ctx.account, table = %record.name, "table_created");

        let location = format!("{}/Tables('{}')", ctx.url_prefix, odata::encode_key(&name));
        if ctx.prefers_no_content() {
            return Ok(TableResponse::new(StatusCode::NO_CONTENT)
                .header("Preference-Applied", PREFER_RETURN_NO_CONTENT)
                .header("Location", location));
        }

        let mut annotations = odata::for_table_entry(&ctx.account, &name, &ctx.url_prefix, verbosity);
        annotations.metadata = odata::for_table(&ctx.account, &name, &ctx.url_prefix, verbosity).metadata;
        let body = Value::Object(table_json(&annotations, &record.name)).to_string();
        Ok(TableResponse::new(StatusCode::CREATED)
            .header("Preference-Applied", PREFER_RETURN_CONTENT)
            .header("Location", location)
            .json(verbosity.content_type(), body))
    }

    pub fn delete_table(&self, ctx: &RequestContext, name: &str) -> TableResult<TableResponse> {
        self.store.delete_table(&ctx.account, name)?;
        tracing::info!(account = %ctx.account, table = name, "table_deleted");
        Ok(TableResponse::new(StatusCode::NO_CONTENT))
    }

    pub fn query_tables(&self, ctx: &RequestContext) -> TableResult<TableResponse> {
        let verbosity = ctx.verbosity()?;
        let query = TableQuery {
            top: self.page_size(ctx),
            filter: parse_filter(ctx)?,
            next_table_name: ctx.query.next_table_name.clone(),
        };
        let page = self.store.query_tables(&ctx.account, &query)?;

        let value: Vec<Value> = page
            .tables
            .iter()
            .map(|t| {
                let annotations =
                    odata::for_table_entry(&ctx.account, &t.name, &ctx.url_prefix, verbosity);
                Value::Object(table_json(&annotations, &t.name))
            })
            .collect();

        let mut body = Map::new();
        if let Some(metadata) = odata::for_table_listing(&ctx.url_prefix, verbosity).metadata {
            body.insert("odata.metadata".to_string(), Value::String(metadata));
        }
        body.insert("value".to_string(), Value::Array(value));

        let mut response = TableResponse::new(StatusCode::OK);
        if let Some(next) = page.next_table_name {
            response = response.header("x-ms-continuation-NextTableName", next);
        }
        Ok(response.json(verbosity.content_type(), Value::Object(body).to_string()))
    }

    pub fn get_access_policy(&self, _ctx: &RequestContext, _table: &str) -> TableResult<TableResponse> {
        Err(TableError::NotImplemented {
            feature: "Get table access policy".to_string(),
        })
    }

    pub fn set_access_policy(&self, _ctx: &RequestContext, _table: &str) -> TableResult<TableResponse> {
        Err(TableError::NotImplemented {
            feature: "Set table access policy".to_string(),
        })
    }

    // Entity Operations

    pub fn insert_entity(
        &self,
        ctx: &RequestContext,
        table: &str,
        body: &[u8],
    ) -> TableResult<TableResponse> {
        let verbosity = ctx.verbosity()?;
        let entity = self.prepare_insert(body)?;
        let stored = self.store.insert_entity(&ctx.account, table, entity)?;
        Ok(self.insert_response(ctx, table, &stored, verbosity))
    }

    /// Insert-or-replace, or replace when `If-Match` is present.
    pub fn update_entity(
        &self,
        ctx: &RequestContext,
        table: &str,
        partition_key: &str,
        row_key: &str,
        body: &[u8],
    ) -> TableResult<TableResponse> {
        let entity = self.prepare_write(partition_key, row_key, body)?;
        let if_match = ctx.if_match();
        tracing::debug!(table, intent = ?classify(if_match), "entity_update");
        let stored = self
            .store
            .insert_or_update_entity(&ctx.account, table, entity, if_match)?;
        Ok(self.write_response(&stored))
    }

    /// Insert-or-merge, or merge when `If-Match` is present.
    pub fn merge_entity(
        &self,
        ctx: &RequestContext,
        table: &str,
        partition_key: &str,
        row_key: &str,
        body: &[u8],
    ) -> TableResult<TableResponse> {
        let entity = self.prepare_write(partition_key, row_key, body)?;
        let if_match = ctx.if_match();
        tracing::debug!(table, intent = ?classify(if_match), "entity_merge");
        let stored = self
            .store
            .insert_or_merge_entity(&ctx.account, table, entity, if_match)?;
        Ok(self.write_response(&stored))
    }

    pub fn delete_entity(
        &self,
        ctx: &RequestContext,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> TableResult<TableResponse> {
        self.store
            .delete_entity(&ctx.account, table, partition_key, row_key, ctx.if_match())?;
        Ok(self.delete_response())
    }

    pub fn query_entities(&self, ctx: &RequestContext, table: &str) -> TableResult<TableResponse> {
        let verbosity = ctx.verbosity()?;
        let query = EntityQuery {
            top: self.page_size(ctx),
            filter: parse_filter(ctx)?,
            next_partition_key: ctx.query.next_partition_key.clone(),
            next_row_key: ctx.query.next_row_key.clone(),
        };
        let page = self.store.query_entities(&ctx.account, table, &query)?;

        let select = ctx.query.select.as_ref();
        let value: Vec<Value> = page
            .entities
            .iter()
            .map(|e| {
                let annotations = odata::for_entity(
                    &ctx.account,
                    table,
                    &ctx.url_prefix,
                    &e.partition_key,
                    &e.row_key,
                    verbosity,
                )
                .without_metadata();
                Value::Object(e.to_response_json(verbosity, &annotations, select))
            })
            .collect();

        let mut body = Map::new();
        if let Some(metadata) = odata::for_entity_listing(table, &ctx.url_prefix, verbosity) {
            body.insert("odata.metadata".to_string(), Value::String(metadata));
        }
        body.insert("value".to_string(), Value::Array(value));

        let mut response = TableResponse::new(StatusCode::OK);
        if let (Some(pk), Some(rk)) = (page.next_partition_key, page.next_row_key) {
            response = response
                .header("x-ms-continuation-NextPartitionKey", pk)
                .header("x-ms-continuation-NextRowKey", rk);
        }
        Ok(response.json(verbosity.content_type(), Value::Object(body).to_string()))
    }

    /// Retrieve one entity by key.
    pub fn query_entity(
        &self,
        ctx: &RequestContext,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> TableResult<TableResponse> {
        let verbosity = ctx.verbosity()?;
        let entity = self
            .store
            .get_entity(&ctx.account, table, partition_key, row_key)?
            .ok_or(TableError::EntityNotFound)?;
        let annotations = odata::for_entity(
            &ctx.account,
            table,
            &ctx.url_prefix,
            partition_key,
            row_key,
            verbosity,
        );
        let body = entity.to_response_string(verbosity, &annotations, ctx.query.select.as_ref());
        Ok(TableResponse::new(StatusCode::OK)
            .header("ETag", entity.etag.clone())
            .json(verbosity.content_type(), body))
    }

    // Entity Group Transactions

    /// Parse, dispatch and serialize a `$batch` request. The HTTP status is 202
    /// whatever the sub-operations did; envelope errors fail the request itself.
    pub fn batch(&self, ctx: &RequestContext, body: &[u8]) -> TableResult<TableResponse> {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        let content_type = ctx.headers.get("content-type").unwrap_or_default();
        let transaction = BatchTransactionParser::new(content_type)?.parse(body)?;
        tracing::debug!(
            operations = transaction.operations.len(),
            partition_key = ?transaction.partition_key,
            "batch_parsed"
        );

        let outcomes = BatchOperationDispatcher::new(self, ctx).execute(&transaction);
        let (content_type, body) = BatchResponseSerializer::new().serialize(&transaction, &outcomes);
        let mut response = TableResponse::new(StatusCode::ACCEPTED)
            .header("Content-Type", content_type)
            .header("DataServiceVersion", super::context::DATA_SERVICE_VERSION);
        response.body = Some(body);
        Ok(response)
    }

    // Shared with the batch dispatcher

    /// Normalize an insert body; the keys come from the body.
    pub(crate) fn prepare_insert(&self, body: &[u8]) -> TableResult<NewEntity> {
        let object = parse_object(body)?.ok_or_else(|| TableError::PropertiesNeedValue {
            field: "body".to_string(),
        })?;
        Ok(normalize(&object)?)
    }

    /// Normalize an update/merge body; the keys come from the URL.
    pub(crate) fn prepare_write(
        &self,
        partition_key: &str,
        row_key: &str,
        body: &[u8],
    ) -> TableResult<NewEntity> {
        let mut object = parse_object(body)?.ok_or_else(|| TableError::PropertiesNeedValue {
            field: "body".to_string(),
        })?;
        for (field, url_value) in [(PARTITION_KEY, partition_key), (ROW_KEY, row_key)] {
            if let Some(body_value) = object.get(field) {
                if body_value.as_str() != Some(url_value) {
                    tracing::warn!(
                        field,
                        url = url_value,
                        body = %body_value,
                        "entity_key_mismatch_using_url"
                    );
                }
            }
            object.insert(field.to_string(), Value::String(url_value.to_string()));
        }
        Ok(normalize(&object)?)
    }

    /// 201 with the entity, or 204 when the client prefers no content.
    pub(crate) fn insert_response(
        &self,
        ctx: &RequestContext,
        table: &str,
        entity: &Entity,
        verbosity: Verbosity,
    ) -> TableResponse {
        if ctx.prefers_no_content() {
            return TableResponse::new(StatusCode::NO_CONTENT)
                .header("Preference-Applied", PREFER_RETURN_NO_CONTENT)
                .header("ETag", entity.etag.clone());
        }
        let annotations = odata::for_entity(
            &ctx.account,
            table,
            &ctx.url_prefix,
            &entity.partition_key,
            &entity.row_key,
            verbosity,
        );
        let location = format!(
            "{}/{}",
            ctx.url_prefix,
            odata::entity_path(table, &entity.partition_key, &entity.row_key)
        );
        TableResponse::new(StatusCode::CREATED)
            .header("Preference-Applied", PREFER_RETURN_CONTENT)
            .header("ETag", entity.etag.clone())
            .header("Location", location)
            .json(
                verbosity.content_type(),
                entity.to_response_string(verbosity, &annotations, None),
            )
    }

    pub(crate) fn write_response(&self, entity: &Entity) -> TableResponse {
        TableResponse::new(StatusCode::NO_CONTENT).header("ETag", entity.etag.clone())
    }

    pub(crate) fn delete_response(&self) -> TableResponse {
        TableResponse::new(StatusCode::NO_CONTENT)
    }

    fn page_size(&self, ctx: &RequestContext) -> usize {
        ctx.query
            .top
            .map_or(self.max_page_size, |top| top.min(self.max_page_size))
    }
}

fn parse_filter(ctx: &RequestContext) -> TableResult<Option<Filter>> {
    ctx.query
        .filter
        .as_deref()
        .filter(|f| !f.trim().is_empty())
        .map(|f| Filter::parse(f).map_err(|e| TableError::invalid_input(format!("invalid $filter: {e}"))))
        .transpose()
}

/// Parse a JSON object body; `Ok(None)` for an empty body.
fn parse_object(body: &[u8]) -> TableResult<Option<Map<String, Value>>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => Ok(Some(object)),
        Ok(_) => Err(TableError::invalid_input("request body must be a JSON object")),
        Err(e) => Err(TableError::invalid_input(format!("malformed JSON body: {e}"))),
    }
}

fn table_json(annotations: &TableAnnotations, name: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in [
        ("odata.metadata", &annotations.metadata),
        ("odata.type", &annotations.odata_type),
        ("odata.id", &annotations.id),
        ("odata.editLink", &annotations.edit_link),
    ] {
        if let Some(v) = value {
            out.insert(key.to_string(), Value::String(v.clone()));
        }
    }
    out.insert("TableName".to_string(), json!(name));
    out
}
