//! Batch dispatch.
//!
//! Sub-operations run through the same façade helpers as single requests. Every
//! mutation is normalized first, in request order, and the first failure stops the
//! batch. The surviving mutations then go to the store in one
//! [`TableStore::apply_transaction`](crate::storage::TableStore::apply_transaction)
//! call, which checks each `If-Match` against the staged state and writes nothing
//! unless all of them pass.

use super::{BatchOperation, BatchTransactionContext, OperationKind};
use crate::concurrency::classify;
use crate::odata::Verbosity;
use crate::protocol::context::{QueryOptions, RequestContext, TableResponse};
use crate::protocol::error::{TableError, TableResult};
use crate::protocol::handler::TableHandler;
use crate::protocol::resource::Resource;
use crate::storage::{EntityMutation, MutationOutcome, StorageError};

/// Outcome of one sub-request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResponse {
    /// Position of the sub-request in the batch
    pub index: usize,
    pub content_id: Option<String>,
    pub response: TableResponse,
}

impl SubResponse {
    pub fn is_success(&self) -> bool {
        self.response.status.is_success()
    }
}

/// A validated sub-operation waiting to be applied
struct Prepared<'a> {
    operation: &'a BatchOperation,
    ctx: RequestContext,
    verbosity: Verbosity,
}

/// Executes a parsed batch against the handler's store.
pub struct BatchOperationDispatcher<'a> {
    handler: &'a TableHandler,
    ctx: &'a RequestContext,
}

impl<'a> BatchOperationDispatcher<'a> {
    pub fn new(handler: &'a TableHandler, ctx: &'a RequestContext) -> Self {
        Self { handler, ctx }
    }

    /// Run the batch. Returns one response per sub-request on success, or only the
    /// failing sub-request's response.
    pub fn execute(&self, transaction: &BatchTransactionContext) -> Vec<SubResponse> {
        if transaction.changeset_boundary.is_none() {
            return transaction
                .operations
                .iter()
                .enumerate()
                .map(|(index, op)| self.retrieve(index, op))
                .collect();
        }

        let mut prepared = Vec::with_capacity(transaction.operations.len());
        let mut mutations = Vec::with_capacity(transaction.operations.len());
        for (index, operation) in transaction.operations.iter().enumerate() {
            match self.prepare(operation) {
                Ok((item, mutation)) => {
                    prepared.push(item);
                    mutations.push(mutation);
                }
                Err(e) => return vec![self.failure(index, operation, &e)],
            }
        }

        let Some(table) = transaction.table.as_deref() else {
            return Vec::new();
        };
        match self
            .handler
            .store()
            .apply_transaction(&self.ctx.account, table, mutations)
        {
            Ok(outcomes) => prepared
                .iter()
                .zip(outcomes)
                .enumerate()
                .map(|(index, (item, outcome))| self.success(index, item, &outcome))
                .collect(),
            Err(StorageError::TransactionAborted { index, source }) => {
                let error = TableError::from(*source);
                let operation = &transaction.operations[index];
                vec![self.failure(index, operation, &error)]
            }
            Err(e) => vec![self.failure(0, &transaction.operations[0], &TableError::from(e))],
        }
    }

    /// Context of a sub-request: the batch's account and URL prefix with the
    /// sub-request's own headers and query.
    fn sub_context(&self, operation: &BatchOperation) -> TableResult<RequestContext> {
        let query = QueryOptions::parse(operation.query.as_deref())?;
        Ok(RequestContext {
            account: self.ctx.account.clone(),
            url_prefix: self.ctx.url_prefix.clone(),
            headers: operation.headers.clone(),
            query,
            request_id: self.ctx.request_id.clone(),
        })
    }

    fn prepare<'o>(
        &self,
        operation: &'o BatchOperation,
    ) -> TableResult<(Prepared<'o>, EntityMutation)> {
        let ctx = self.sub_context(operation)?;
        let verbosity = ctx.verbosity()?;
        let if_match = ctx.if_match().map(str::to_string);
        tracing::debug!(
            verb = operation.verb.as_str(),
            kind = ?operation.kind,
            intent = ?classify(if_match.as_deref()),
            "batch_operation"
        );

        let mutation = match (&operation.kind, &operation.resource) {
            (OperationKind::Insert, _) => {
                EntityMutation::Insert(self.handler.prepare_insert(&operation.body)?)
            }
            (
                OperationKind::Upsert,
                Resource::Entity {
                    partition_key,
                    row_key,
                    ..
                },
            ) => EntityMutation::Replace {
                entity: self
                    .handler
                    .prepare_write(partition_key, row_key, &operation.body)?,
                if_match,
            },
            (
                OperationKind::Merge,
                Resource::Entity {
                    partition_key,
                    row_key,
                    ..
                },
            ) => EntityMutation::Merge {
                entity: self
                    .handler
                    .prepare_write(partition_key, row_key, &operation.body)?,
                if_match,
            },
            (
                OperationKind::Delete,
                Resource::Entity {
                    partition_key,
                    row_key,
                    ..
                },
            ) => EntityMutation::Delete {
                partition_key: partition_key.clone(),
                row_key: row_key.clone(),
                if_match,
            },
            (kind, _) => {
                return Err(TableError::invalid_input(format!(
                    "{kind:?} cannot be part of a changeset"
                )))
            }
        };

        Ok((
            Prepared {
                operation,
                ctx,
                verbosity,
            },
            mutation,
        ))
    }

    fn retrieve(&self, index: usize, operation: &BatchOperation) -> SubResponse {
        let result = self.sub_context(operation).and_then(|ctx| {
            let Resource::Entity {
                table,
                partition_key,
                row_key,
            } = &operation.resource
            else {
                return Err(TableError::invalid_input("retrieve needs an entity key"));
            };
            self.handler
                .query_entity(&ctx, table, partition_key, row_key)
        });
        match result {
            Ok(response) => SubResponse {
                index,
                content_id: Some(content_id(index, operation)),
                response,
            },
            Err(e) => self.failure(index, operation, &e),
        }
    }

    fn success(&self, index: usize, item: &Prepared<'_>, outcome: &MutationOutcome) -> SubResponse {
        let response = match outcome {
            MutationOutcome::Written(entity) if item.operation.kind == OperationKind::Insert => {
                self.handler
                    .insert_response(&item.ctx, item.operation.table(), entity, item.verbosity)
            }
            MutationOutcome::Written(entity) => self.handler.write_response(entity),
            MutationOutcome::Deleted => self.handler.delete_response(),
        };
        SubResponse {
            index,
            content_id: Some(content_id(index, item.operation)),
            response,
        }
    }

    fn failure(&self, index: usize, operation: &BatchOperation, error: &TableError) -> SubResponse {
        tracing::debug!(
            index,
            verb = operation.verb.as_str(),
            code = error.code(),
            error = %error,
            "batch_operation_failed"
        );
        let ctx = self
            .sub_context(operation)
            .unwrap_or_else(|_| self.ctx.clone());
        SubResponse {
            index,
            content_id: None,
            response: self.handler.error_response(&ctx, error, Some(index)),
        }
    }
}

/// `Content-ID` echoed for a sub-request: its own, or its 1-based position.
fn content_id(index: usize, operation: &BatchOperation) -> String {
    operation
        .content_id
        .clone()
        .unwrap_or_else(|| (index + 1).to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;

    use super::*;
    use crate::batch::BatchTransactionParser;
    use crate::storage::{MemoryTableStore, TableStore};

    const ACCOUNT: &str = "devstoreaccount1";
    const PREFIX: &str = "http://127.0.0.1:10002/devstoreaccount1";

    fn setup() -> (TableHandler, RequestContext) {
        let store = MemoryTableStore::new();
        store.create_table(ACCOUNT, "orders").unwrap();
        let handler = TableHandler::new(Arc::new(store), 1000);
        (handler, RequestContext::new(ACCOUNT, PREFIX))
    }

    fn batch(parts: &[String]) -> BatchTransactionContext {
        let mut body = String::from(
            "--batch_1\r\nContent-Type: multipart/mixed; boundary=changeset_1\r\n\r\n",
        );
        for part in parts {
            body.push_str("--changeset_1\r\nContent-Type: application/http\r\n");
            body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
            body.push_str(part);
            body.push_str("\r\n");
        }
        body.push_str("--changeset_1--\r\n--batch_1--\r\n");
        BatchTransactionParser::new("multipart/mixed; boundary=batch_1")
            .unwrap()
            .parse(body.as_bytes())
            .unwrap()
    }

    fn insert(rk: &str) -> String {
        format!(
            "POST {PREFIX}/orders HTTP/1.1\r\nContent-Type: application/json\r\n\r\n\
             {{\"PartitionKey\":\"p\",\"RowKey\":\"{rk}\",\"V\":1}}"
        )
    }

    fn put(rk: &str, if_match: &str) -> String {
        format!(
            "PUT {PREFIX}/orders(PartitionKey='p',RowKey='{rk}') HTTP/1.1\r\n\
             If-Match: {if_match}\r\n\r\n{{\"V\":2}}"
        )
    }

    #[test]
    fn test_all_succeed_in_order() {
        let (handler, ctx) = setup();
        let tx = batch(&[insert("1"), insert("2")]);
        let responses = BatchOperationDispatcher::new(&handler, &ctx).execute(&tx);
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(SubResponse::is_success));
        assert_eq!(responses[0].response.status, StatusCode::CREATED);
        assert_eq!(responses[1].content_id.as_deref(), Some("2"));
        assert!(handler
            .store()
            .get_entity(ACCOUNT, "orders", "p", "2")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_precondition_failure_stops_batch() {
        let (handler, ctx) = setup();
        let tx = batch(&[put("a", "W/\"datetime'stale'\""), insert("b")]);
        let responses = BatchOperationDispatcher::new(&handler, &ctx).execute(&tx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].index, 0);
        assert_eq!(responses[0].response.status, StatusCode::NOT_FOUND);
        assert!(handler
            .store()
            .get_entity(ACCOUNT, "orders", "p", "b")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failure_rolls_back_earlier_operations() {
        let (handler, ctx) = setup();
        handler
            .store()
            .insert_entity(
                ACCOUNT,
                "orders",
                crate::entity::NewEntity {
                    partition_key: "p".into(),
                    row_key: "x".into(),
                    properties: Default::default(),
                },
            )
            .unwrap();
        let tx = batch(&[insert("1"), put("x", "W/\"datetime'stale'\"")]);
        let responses = BatchOperationDispatcher::new(&handler, &ctx).execute(&tx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].index, 1);
        assert_eq!(responses[0].response.status, StatusCode::PRECONDITION_FAILED);
        let body = responses[0].response.body.as_deref().unwrap();
        assert!(body.contains("\"1:"));
        assert!(handler
            .store()
            .get_entity(ACCOUNT, "orders", "p", "1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_normalization_failure_reports_index() {
        let (handler, ctx) = setup();
        let bad = format!(
            "POST {PREFIX}/orders HTTP/1.1\r\n\r\n{{\"PartitionKey\":\"p\",\"RowKey\":\"a/b\"}}"
        );
        let tx = batch(&[insert("1"), bad]);
        let responses = BatchOperationDispatcher::new(&handler, &ctx).execute(&tx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].index, 1);
        assert_eq!(responses[0].response.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_table_is_reported_on_first_operation() {
        let handler = TableHandler::new(Arc::new(MemoryTableStore::new()), 1000);
        let ctx = RequestContext::new(ACCOUNT, PREFIX);
        let tx = batch(&[insert("1")]);
        let responses = BatchOperationDispatcher::new(&handler, &ctx).execute(&tx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response.status, StatusCode::NOT_FOUND);
    }
}
