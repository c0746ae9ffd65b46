//! Batch response rendering.

use uuid::Uuid;

use super::{BatchTransactionContext, SubResponse};
use crate::protocol::context::DATA_SERVICE_VERSION;

const CRLF: &str = "\r\n";

/// Renders sub-responses as a `multipart/mixed` body mirroring the request: an
/// outer `batch_` boundary and, when the request had one, a `changeset_` boundary.
#[derive(Debug, Clone)]
pub struct BatchResponseSerializer {
    batch_boundary: String,
    changeset_boundary: String,
}

impl Default for BatchResponseSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchResponseSerializer {
    /// Serializer with fresh boundary tokens.
    pub fn new() -> Self {
        Self {
            batch_boundary: format!("batch_{}", Uuid::new_v4()),
            changeset_boundary: format!("changeset_{}", Uuid::new_v4()),
        }
    }

    /// Returns `(content_type, body)`.
    pub fn serialize(
        &self,
        transaction: &BatchTransactionContext,
        responses: &[SubResponse],
    ) -> (String, String) {
        let batch = unique_boundary(&self.batch_boundary, "batch", responses);
        let changeset = unique_boundary(&self.changeset_boundary, "changeset", responses);

        let mut body = String::new();
        if transaction.changeset_boundary.is_some() && !responses.is_empty() {
            body.push_str(&format!("--{batch}{CRLF}"));
            body.push_str(&format!(
                "Content-Type: multipart/mixed; boundary={changeset}{CRLF}{CRLF}"
            ));
            for response in responses {
                body.push_str(&format!("--{changeset}{CRLF}"));
                write_part(&mut body, response);
            }
            body.push_str(&format!("--{changeset}--{CRLF}"));
        } else {
            for response in responses {
                body.push_str(&format!("--{batch}{CRLF}"));
                write_part(&mut body, response);
            }
        }
        body.push_str(&format!("--{batch}--{CRLF}"));

        (format!("multipart/mixed; boundary={batch}"), body)
    }
}

/// Regenerate `boundary` until no sub-response body contains it.
fn unique_boundary(boundary: &str, prefix: &str, responses: &[SubResponse]) -> String {
    let clashes = |candidate: &str| {
        responses
            .iter()
            .filter_map(|r| r.response.body.as_deref())
            .any(|body| body.contains(candidate))
    };
    let mut candidate = boundary.to_string();
    while clashes(&candidate) {
        candidate = format!("{prefix}_{}", Uuid::new_v4());
    }
    candidate
}

fn write_part(out: &mut String, sub: &SubResponse) {
    let response = &sub.response;
    out.push_str(&format!("Content-Type: application/http{CRLF}"));
    out.push_str(&format!("Content-Transfer-Encoding: binary{CRLF}{CRLF}"));
    out.push_str(&format!(
        "HTTP/1.1 {} {}{CRLF}",
        response.status.as_u16(),
        response.status.canonical_reason().unwrap_or_default()
    ));
    out.push_str(&format!("X-Content-Type-Options: nosniff{CRLF}"));
    out.push_str(&format!("Cache-Control: no-cache{CRLF}"));
    if response.header_value("DataServiceVersion").is_none() {
        out.push_str(&format!("DataServiceVersion: {DATA_SERVICE_VERSION}{CRLF}"));
    }
    if sub.is_success() {
        if let Some(content_id) = &sub.content_id {
            out.push_str(&format!("Content-ID: {content_id}{CRLF}"));
        }
    }
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}{CRLF}"));
    }
    out.push_str(CRLF);
    if let Some(body) = &response.body {
        out.push_str(body);
        out.push_str(CRLF);
    }
}
