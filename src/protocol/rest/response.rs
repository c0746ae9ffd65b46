//! Conversion of protocol results into axum responses.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::odata::MINIMAL_METADATA;
use crate::protocol::{TableError, TableResponse};

impl IntoResponse for TableResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body.map_or_else(Body::empty, Body::from));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!(header = %name, "invalid_response_header_dropped"),
            }
        }
        response
    }
}

/// Standalone rendering for errors raised outside [`TableHandler`](crate::protocol::TableHandler),
/// which has no request context to take an id from.
impl IntoResponse for TableError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let body = self.odata_body(&request_id, None).to_string();
        TableResponse::new(self.status())
            .header("x-ms-request-id", request_id)
            .json(MINIMAL_METADATA, body)
            .into_response()
    }
}
