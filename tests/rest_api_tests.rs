//! REST API endpoint tests (tower test utilities, no server needed).

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tablestore::config::HttpConfig;
use tablestore::protocol::rest::create_router;
use tablestore::{Config, TableHandler};
use tower::ServiceExt;

const ACCOUNT: &str = "/devstoreaccount1";

fn create_test_app() -> axum::Router {
    let handler = Arc::new(TableHandler::from_config(&Config::default()));
    create_router(handler, &HttpConfig::default())
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<String>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(body.map_or_else(Body::empty, Body::from))
        .unwrap();
    app.clone().oneshot(req).await.unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap_or(json!({}))
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn create_table(app: &axum::Router, name: &str) {
    let resp = send(
        app,
        "POST",
        &format!("{ACCOUNT}/Tables"),
        &[("content-type", "application/json")],
        Some(json!({ "TableName": name }).to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED, "create table {name}");
}

async fn insert(app: &axum::Router, table: &str, entity: Value) -> Response {
    send(
        app,
        "POST",
        &format!("{ACCOUNT}/{table}"),
        &[("content-type", "application/json")],
        Some(entity.to_string()),
    )
    .await
}

// Health & Admin Endpoints
#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app();
    let resp = send(&app, "GET", "/health", &[], None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["data"]["status"], "healthy");
    assert!(json["data"]["version"].is_string());
}

#[tokio::test]
async fn test_metrics_counts_requests() {
    let app = create_test_app();
    create_table(&app, "counted").await;
    let resp = send(&app, "GET", "/metrics", &[], None).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["tables"], 1);
    assert!(json["data"]["requests"].as_u64().unwrap() >= 1);
}

// Tables
#[tokio::test]
async fn test_create_table_returns_location_and_body() {
    let app = create_test_app();
    let resp = send(
        &app,
        "POST",
        &format!("{ACCOUNT}/Tables"),
        &[("content-type", "application/json")],
        Some(r#"{"TableName":"orders"}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(
        header(&resp, "location"),
        Some("http://127.0.0.1:10002/devstoreaccount1/Tables('orders')")
    );
    assert_eq!(header(&resp, "preference-applied"), Some("return-content"));
    assert!(header(&resp, "x-ms-request-id").is_some());
    assert!(header(&resp, "date").unwrap().ends_with("GMT"));
    let json = body_json(resp).await;
    assert_eq!(json["TableName"], "orders");
    assert!(json["odata.metadata"]
        .as_str()
        .unwrap()
        .ends_with("$metadata#Tables/@Element"));
}

#[tokio::test]
async fn test_create_table_conflict() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = send(
        &app,
        "POST",
        &format!("{ACCOUNT}/Tables"),
        &[],
        Some(r#"{"TableName":"Orders"}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let json = body_json(resp).await;
    assert_eq!(json["odata.error"]["code"], "TableAlreadyExists");
}

#[tokio::test]
async fn test_create_table_invalid_name() {
    let app = create_test_app();
    let resp = send(
        &app,
        "POST",
        &format!("{ACCOUNT}/Tables"),
        &[],
        Some(r#"{"TableName":"1bad"}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["odata.error"]["code"], "InvalidInput");
    assert_eq!(json["odata.error"]["message"]["lang"], "en-US");
}

#[tokio::test]
async fn test_query_and_delete_tables() {
    let app = create_test_app();
    create_table(&app, "alpha").await;
    create_table(&app, "beta").await;

    let resp = send(&app, "GET", &format!("{ACCOUNT}/Tables"), &[], None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let names: Vec<&str> = json["value"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["TableName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let resp = send(&app, "DELETE", &format!("{ACCOUNT}/Tables('alpha')"), &[], None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = send(&app, "GET", &format!("{ACCOUNT}/alpha()"), &[], None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let json = body_json(resp).await;
    assert_eq!(json["odata.error"]["code"], "TableNotFound");
}

#[tokio::test]
async fn test_tables_are_scoped_by_account() {
    let app = create_test_app();
    create_table(&app, "shared").await;
    let resp = send(&app, "GET", "/otheraccount/Tables", &[], None).await;
    let json = body_json(resp).await;
    assert!(json["value"].as_array().unwrap().is_empty());
}

// Entities
#[tokio::test]
async fn test_insert_and_retrieve_typed_entity() {
    let app = create_test_app();
    create_table(&app, "orders").await;

    let resp = insert(
        &app,
        "orders",
        json!({
            "PartitionKey": "p1",
            "RowKey": "r1",
            "Count": 5,
            "Big": "12",
            "Big@odata.type": "Edm.Int64",
            "Active": true
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = header(&resp, "etag").unwrap().to_string();
    assert!(etag.starts_with("W/\"datetime'"));

    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders(PartitionKey='p1',RowKey='r1')"),
        &[],
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "etag"), Some(etag.as_str()));
    let json = body_json(resp).await;
    assert_eq!(json["Count"], 5);
    assert_eq!(json["Big"], "12");
    assert_eq!(json["Big@odata.type"], "Edm.Int64");
    assert_eq!(json["Active"], true);
    assert_eq!(json["odata.etag"], etag);
    assert!(json["Timestamp"].is_string());
}

#[tokio::test]
async fn test_insert_duplicate_conflicts() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let entity = json!({"PartitionKey": "p", "RowKey": "r"});
    assert_eq!(insert(&app, "orders", entity.clone()).await.status(), StatusCode::CREATED);
    let resp = insert(&app, "orders", entity).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(resp).await["odata.error"]["code"], "EntityAlreadyExists");
}

#[tokio::test]
async fn test_insert_without_row_key() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = insert(&app, "orders", json!({"PartitionKey": "p"})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["odata.error"]["code"], "PropertiesNeedValue");
}

#[tokio::test]
async fn test_update_with_stale_etag_fails() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "r", "V": 1})).await;
    let first = header(&resp, "etag").unwrap().to_string();
    let uri = format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='r')");

    let resp = send(
        &app,
        "PUT",
        &uri,
        &[("If-Match", first.as_str())],
        Some(r#"{"V":2}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let second = header(&resp, "etag").unwrap().to_string();
    assert_ne!(first, second);

    let resp = send(
        &app,
        "PUT",
        &uri,
        &[("If-Match", first.as_str())],
        Some(r#"{"V":3}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(
        body_json(resp).await["odata.error"]["code"],
        "UpdateConditionNotSatisfied"
    );

    let json = body_json(send(&app, "GET", &uri, &[], None).await).await;
    assert_eq!(json["V"], 2);
}

#[tokio::test]
async fn test_merge_method_keeps_existing_properties() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "r", "A": 1})).await;
    let uri = format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='r')");

    let resp = send(
        &app,
        "MERGE",
        &uri,
        &[("If-Match", "*")],
        Some(r#"{"B":"two"}"#.to_string()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let json = body_json(send(&app, "GET", &uri, &[], None).await).await;
    assert_eq!(json["A"], 1);
    assert_eq!(json["B"], "two");
}

#[tokio::test]
async fn test_upsert_without_if_match_creates() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let uri = format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='new')");
    let resp = send(&app, "PUT", &uri, &[], Some(r#"{"V":1}"#.to_string())).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(header(&resp, "etag").is_some());
    assert_eq!(send(&app, "GET", &uri, &[], None).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_delete_entity() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "r"})).await;
    let uri = format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='r')");

    let resp = send(&app, "DELETE", &uri, &[("If-Match", "*")], None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = send(&app, "GET", &uri, &[], None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["odata.error"]["code"], "ResourceNotFound");
}

#[tokio::test]
async fn test_encoded_keys_round_trip() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "a b", "RowKey": "it's"})).await;
    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders(PartitionKey='a%20b',RowKey='it''s')"),
        &[],
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["RowKey"], "it's");
}

#[tokio::test]
async fn test_query_entities_filter_and_paging() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    for i in 0..5 {
        insert(
            &app,
            "orders",
            json!({"PartitionKey": "p", "RowKey": format!("r{i}"), "N": i}),
        )
        .await;
    }

    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders()?$filter=N%20ge%203"),
        &[],
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["value"].as_array().unwrap().len(), 2);

    let resp = send(&app, "GET", &format!("{ACCOUNT}/orders()?$top=2"), &[], None).await;
    assert_eq!(header(&resp, "x-ms-continuation-nextpartitionkey"), Some("p"));
    assert_eq!(header(&resp, "x-ms-continuation-nextrowkey"), Some("r2"));
    let json = body_json(resp).await;
    assert_eq!(json["value"].as_array().unwrap().len(), 2);

    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders()?NextPartitionKey=p&NextRowKey=r2&$select=N"),
        &[],
        None,
    )
    .await;
    let json = body_json(resp).await;
    let rows = json["value"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["N"], 2);
    assert_eq!(rows[0]["PartitionKey"], "p");
}

#[tokio::test]
async fn test_nometadata_omits_annotations() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "r"})).await;
    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='r')"),
        &[("Accept", "application/json;odata=nometadata")],
        None,
    )
    .await;
    assert_eq!(
        header(&resp, "content-type"),
        Some("application/json;odata=nometadata")
    );
    let json = body_json(resp).await;
    assert!(json.get("odata.metadata").is_none());
    assert!(json.get("odata.etag").is_none());
}

#[tokio::test]
async fn test_atom_not_supported() {
    let app = create_test_app();
    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/Tables"),
        &[("Accept", "application/atom+xml")],
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["odata.error"]["code"], "AtomFormatNotSupported");
}

#[tokio::test]
async fn test_client_request_id_echoed() {
    let app = create_test_app();
    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/Tables"),
        &[("x-ms-client-request-id", "abc-123")],
        None,
    )
    .await;
    assert_eq!(header(&resp, "x-ms-client-request-id"), Some("abc-123"));
    assert_eq!(header(&resp, "x-ms-version"), Some("2019-02-02"));
}

#[tokio::test]
async fn test_access_policy_not_implemented() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = send(&app, "GET", &format!("{ACCOUNT}/orders?comp=acl"), &[], None).await;
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_method_not_allowed() {
    let app = create_test_app();
    let resp = send(&app, "PUT", &format!("{ACCOUNT}/Tables"), &[], None).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// Batches
fn changeset_body(parts: &[(&str, &str, &str, &[(&str, &str)])]) -> String {
    let mut body = String::new();
    body.push_str("--batch_a1\r\n");
    body.push_str("Content-Type: multipart/mixed; boundary=changeset_b2\r\n\r\n");
    for (i, (verb, path, json, headers)) in parts.iter().enumerate() {
        body.push_str("--changeset_b2\r\n");
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!(
            "{verb} http://127.0.0.1:10002/devstoreaccount1/{path} HTTP/1.1\r\n"
        ));
        body.push_str("Accept: application/json;odata=minimalmetadata\r\n");
        body.push_str("Content-Type: application/json\r\n");
        body.push_str(&format!("Content-ID: {}\r\n", i + 1));
        for (name, value) in *headers {
            body.push_str(&format!("{name}: {value}\r\n"));
        }
        body.push_str("\r\n");
        body.push_str(json);
        body.push_str("\r\n");
    }
    body.push_str("--changeset_b2--\r\n\r\n--batch_a1--\r\n");
    body
}

async fn send_batch(app: &axum::Router, body: String) -> Response {
    send(
        app,
        "POST",
        &format!("{ACCOUNT}/$batch"),
        &[("content-type", "multipart/mixed; boundary=batch_a1")],
        Some(body),
    )
    .await
}

#[tokio::test]
async fn test_batch_inserts_commit_together() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = send_batch(
        &app,
        changeset_body(&[
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"1"}"#, &[]),
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"2"}"#, &[]),
        ]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(header(&resp, "content-type")
        .unwrap()
        .starts_with("multipart/mixed; boundary=batch_"));
    let body = body_string(resp).await;
    assert_eq!(body.matches("HTTP/1.1 201 Created").count(), 2);
    assert!(body.contains("Content-ID: 2\r\n"));

    let json = body_json(send(&app, "GET", &format!("{ACCOUNT}/orders()"), &[], None).await).await;
    assert_eq!(json["value"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_batch_failure_rolls_back() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "taken"})).await;

    let resp = send_batch(
        &app,
        changeset_body(&[
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"fresh"}"#, &[]),
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"taken"}"#, &[]),
        ]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_string(resp).await;
    assert_eq!(body.matches("HTTP/1.1 ").count(), 1);
    assert!(body.contains("HTTP/1.1 409 Conflict"));
    assert!(body.contains("\"value\":\"1:"));

    let resp = send(
        &app,
        "GET",
        &format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='fresh')"),
        &[],
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_multiple_partitions_rejected() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    let resp = send_batch(
        &app,
        changeset_body(&[
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"1"}"#, &[]),
            ("POST", "orders", r#"{"PartitionKey":"q","RowKey":"2"}"#, &[]),
        ]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(resp).await["odata.error"]["code"],
        "CommandsInBatchActOnDifferentPartitions"
    );
}

#[tokio::test]
async fn test_batch_mixed_operations() {
    let app = create_test_app();
    create_table(&app, "orders").await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "old", "V": 1})).await;
    insert(&app, "orders", json!({"PartitionKey": "p", "RowKey": "gone"})).await;

    let resp = send_batch(
        &app,
        changeset_body(&[
            ("POST", "orders", r#"{"PartitionKey":"p","RowKey":"new"}"#, &[]),
            (
                "MERGE",
                "orders(PartitionKey='p',RowKey='old')",
                r#"{"W":2}"#,
                &[("If-Match", "*")],
            ),
            ("DELETE", "orders(PartitionKey='p',RowKey='gone')", "", &[("If-Match", "*")]),
        ]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_string(resp).await;
    assert_eq!(body.matches("HTTP/1.1 204 No Content").count(), 2);

    let json = body_json(
        send(
            &app,
            "GET",
            &format!("{ACCOUNT}/orders(PartitionKey='p',RowKey='old')"),
            &[],
            None,
        )
        .await,
    )
    .await;
    assert_eq!(json["V"], 1);
    assert_eq!(json["W"], 2);
}
