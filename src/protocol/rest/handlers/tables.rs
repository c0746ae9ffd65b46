//! Table Service Handler
//!
//! One axum handler for every `/{account}/{resource}` request. The raw request is
//! turned into a [`RequestContext`] and handed to [`TableHandler::handle`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    http::{header, HeaderMap, Method, Uri},
    Extension,
};

use crate::protocol::rest::ServiceEndpoint;
use crate::protocol::resource::split_path;
use crate::protocol::{Headers, QueryOptions, RequestContext, TableHandler, TableResponse};

/// Entry point for tables, entities and `$batch`.
pub async fn dispatch(
    Extension(handler): Extension<Arc<TableHandler>>,
    Extension(endpoint): Extension<ServiceEndpoint>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> TableResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(endpoint.default_host.as_str())
        .to_string();
    let headers = collect_headers(&headers);

    // the raw path keeps percent-escapes so keys decode exactly once
    let path = uri.path();
    let raw_account = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();

    let parsed = split_path(path)
        .and_then(|(account, resource)| Ok((account, resource, QueryOptions::parse(uri.query())?)));

    match parsed {
        Ok((account, resource, query)) => {
            let prefix = format!("{}://{host}/{account}", endpoint.scheme);
            let ctx = RequestContext::new(account, prefix)
                .with_headers(headers)
                .with_query(query);
            tracing::debug!(
                method = %method,
                account = %ctx.account,
                request_id = %ctx.request_id,
                "table_request"
            );
            handler.handle(method.as_str(), &resource, &ctx, &body)
        }
        Err(e) => {
            let prefix = format!("{}://{host}/{raw_account}", endpoint.scheme);
            let ctx = RequestContext::new(raw_account, prefix).with_headers(headers);
            handler.reject(&ctx, &e)
        }
    }
}

fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        match value.to_str() {
            Ok(value) => headers.insert(name.as_str(), value),
            Err(_) => tracing::debug!(header = %name, "non_ascii_request_header_ignored"),
        }
    }
    headers
}
