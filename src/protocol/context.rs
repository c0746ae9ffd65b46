//! Request/response abstraction between the HTTP layer and the table service.
//!
//! The service never sees axum request types: the REST layer (and the batch parser,
//! for sub-requests) build a [`RequestContext`], and every operation answers with a
//! [`TableResponse`] that the caller renders.

use std::collections::HashSet;

use axum::http::StatusCode;
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use super::error::{TableError, TableResult};
use crate::odata::Verbosity;

/// Service version reported when the client does not send `x-ms-version`.
pub const DEFAULT_SERVICE_VERSION: &str = "2019-02-02";

/// `DataServiceVersion` sent with JSON payloads.
pub const DATA_SERVICE_VERSION: &str = "3.0;";

pub const PREFER_RETURN_CONTENT: &str = "return-content";
pub const PREFER_RETURN_NO_CONTENT: &str = "return-no-content";

/// Request headers, looked up case-insensitively, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header; a repeated name keeps the first value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.trim().to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// OData system query options and continuation parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub format: Option<String>,
    pub top: Option<usize>,
    pub select: Option<HashSet<String>>,
    pub filter: Option<String>,
    pub next_table_name: Option<String>,
    pub next_partition_key: Option<String>,
    pub next_row_key: Option<String>,
    /// `comp=` (only `acl` is recognised)
    pub comp: Option<String>,
}

impl QueryOptions {
    /// Parse a raw query string. Unknown parameters are ignored.
    pub fn parse(query: Option<&str>) -> TableResult<Self> {
        let mut options = QueryOptions::default();
        let Some(query) = query else {
            return Ok(options);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = percent_decode_str(raw_name).decode_utf8_lossy();
            let value = percent_decode_str(raw_value)
                .decode_utf8()
                .map_err(|_| TableError::invalid_input(format!("query option {name} is not UTF-8")))?
                .into_owned();
            match name.as_ref() {
                "$format" => options.format = Some(value),
                "$top" => {
                    let top = value.trim().parse::<usize>().map_err(|_| {
                        TableError::invalid_input(format!("invalid $top value '{value}'"))
                    })?;
                    options.top = Some(top);
                }
                "$select" => {
                    let names: HashSet<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    options.select = (!names.is_empty()).then_some(names);
                }
                "$filter" => options.filter = Some(value),
                "NextTableName" => options.next_table_name = Some(value),
                "NextPartitionKey" => options.next_partition_key = Some(value),
                "NextRowKey" => options.next_row_key = Some(value),
                "comp" => options.comp = Some(value),
                _ => {}
            }
        }
        Ok(options)
    }
}

/// Everything an operation needs to know about the request that carries it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub account: String,
    /// `<scheme>://<host>/<account>`, the base of every OData link
    pub url_prefix: String,
    pub headers: Headers,
    pub query: QueryOptions,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(account: impl Into<String>, url_prefix: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            url_prefix: url_prefix.into(),
            headers: Headers::new(),
            query: QueryOptions::default(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    /// Negotiated verbosity. `$format` takes precedence over `Accept`.
    pub fn verbosity(&self) -> TableResult<Verbosity> {
        if let Some(format) = &self.query.format {
            return Verbosity::from_format(format).ok_or_else(|| {
                TableError::AtomFormatNotSupported {
                    accept: format.clone(),
                }
            });
        }
        let accept = self.headers.get("accept");
        Verbosity::from_accept(accept).ok_or_else(|| TableError::AtomFormatNotSupported {
            accept: accept.unwrap_or_default().to_string(),
        })
    }

    /// Raw `If-Match`; `Some("")` is distinct from `None`.
    pub fn if_match(&self) -> Option<&str> {
        self.headers.get("if-match").map(str::trim)
    }

    /// `Prefer: return-no-content`
    pub fn prefers_no_content(&self) -> bool {
        self.headers
            .get("prefer")
            .is_some_and(|p| p.split(',').any(|v| v.trim() == PREFER_RETURN_NO_CONTENT))
    }

    pub fn service_version(&self) -> &str {
        self.headers
            .get("x-ms-version")
            .unwrap_or(DEFAULT_SERVICE_VERSION)
    }

    pub fn client_request_id(&self) -> Option<&str> {
        self.headers.get("x-ms-client-request-id")
    }
}

/// Transport-independent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl TableResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// JSON payload with the negotiated content type.
    pub fn json(self, content_type: &str, body: String) -> Self {
        let mut response = self
            .header("Content-Type", content_type)
            .header("DataServiceVersion", DATA_SERVICE_VERSION);
        response.body = Some(body);
        response
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let headers: Headers = [("If-Match", "*"), ("Accept", "application/json")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("if-match"), Some("*"));
        assert_eq!(headers.get("ACCEPT"), Some("application/json"));
        assert_eq!(headers.get("prefer"), None);
    }

    #[test]
    fn test_query_options() {
        let q = QueryOptions::parse(Some(
            "$top=5&$select=A,%20B,,&$filter=PartitionKey%20eq%20'p'&NextRowKey=r&foo=bar",
        ))
        .unwrap();
        assert_eq!(q.top, Some(5));
        let select = q.select.unwrap();
        assert!(select.contains("A") && select.contains("B"));
        assert_eq!(select.len(), 2);
        assert_eq!(q.filter.as_deref(), Some("PartitionKey eq 'p'"));
        assert_eq!(q.next_row_key.as_deref(), Some("r"));
    }

    #[test]
    fn test_invalid_top() {
        assert!(matches!(
            QueryOptions::parse(Some("$top=abc")),
            Err(TableError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_format_overrides_accept() {
        let ctx = RequestContext::new("acct", "http://h/acct")
            .with_headers([("Accept", "application/json;odata=nometadata")].into_iter().collect())
            .with_query(QueryOptions::parse(Some("$format=application/json;odata=fullmetadata")).unwrap());
        assert_eq!(ctx.verbosity(), Ok(Verbosity::Full));
    }

    #[test]
    fn test_atom_rejected() {
        let ctx = RequestContext::new("acct", "http://h/acct")
            .with_headers([("Accept", "application/atom+xml")].into_iter().collect());
        assert!(matches!(
            ctx.verbosity(),
            Err(TableError::AtomFormatNotSupported { .. })
        ));
    }

    #[test]
    fn test_empty_if_match_is_not_absent() {
        let ctx = RequestContext::new("acct", "p")
            .with_headers([("If-Match", "")].into_iter().collect());
        assert_eq!(ctx.if_match(), Some(""));
        assert_eq!(RequestContext::new("acct", "p").if_match(), None);
    }

    #[test]
    fn test_prefer() {
        let ctx = RequestContext::new("acct", "p")
            .with_headers([("Prefer", "return-no-content")].into_iter().collect());
        assert!(ctx.prefers_no_content());
        assert!(!RequestContext::new("acct", "p").prefers_no_content());
    }
}
