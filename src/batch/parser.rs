//! `$batch` envelope parser.
//!
//! A line-oriented state machine over a CRLF-delimited body:
//!
//! ```text
//! ExpectOuterBoundary -> ExpectChangesetHeader -> ExpectChangesetBoundary
//!   -> ReadingPartHeaders -> ReadingRequestLine -> ReadingSubRequestHeaders
//!   -> ReadingSubRequestBody -> (ReadingPartHeaders | ExpectChangesetClose) -> Done
//! ```
//!
//! A bare `GET` skips the changeset states and ends at the closing outer boundary.
//! Envelope, part header and request lines must end in CRLF. Sub-request bodies are
//! JSON and are kept as-is, so a bare LF inside a body is payload, not a line break.
//! Any structural error rejects the whole batch before anything is dispatched.

use super::{
    BatchOperation, BatchTransactionContext, BatchVerb, OperationKind, MAX_OPERATIONS,
};
use crate::protocol::context::Headers;
use crate::protocol::error::{TableError, TableResult};
use crate::protocol::resource::split_target;

const CRLF: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectOuterBoundary,
    ExpectChangesetHeader,
    ExpectChangesetBoundary,
    ReadingPartHeaders,
    ReadingRequestLine,
    ReadingSubRequestHeaders,
    ReadingSubRequestBody,
    ExpectChangesetClose,
    Done,
}

/// Boundary lines seen while reading a sub-request body.
enum Delimiter {
    Next,
    Close,
}

fn invalid(message: impl Into<String>) -> TableError {
    TableError::invalid_input(format!("malformed batch request: {}", message.into()))
}

/// Extract `boundary=` from a `multipart/mixed` content type.
pub fn boundary_param(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';').map(str::trim);
    let media = parts.next()?;
    if !media.eq_ignore_ascii_case("multipart/mixed") {
        return None;
    }
    parts.find_map(|p| {
        let (name, value) = p.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Splits on CRLF; the final piece may lack a terminator.
struct Lines<'a> {
    rest: &'a str,
    done: bool,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            done: false,
        }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.done {
            return None;
        }
        match self.rest.find(CRLF) {
            Some(i) => {
                let line = &self.rest[..i];
                self.rest = &self.rest[i + CRLF.len()..];
                Some(line)
            }
            None => {
                self.done = true;
                Some(self.rest)
            }
        }
    }
}

/// Sub-request under construction
#[derive(Default)]
struct PendingPart<'a> {
    part_headers: Headers,
    request_line: Option<(BatchVerb, String)>,
    headers: Headers,
    body: Vec<&'a str>,
}

/// Parses one `$batch` body.
#[derive(Debug, Clone)]
pub struct BatchTransactionParser {
    boundary: String,
}

impl BatchTransactionParser {
    /// `content_type` is the request's `Content-Type`, which declares the outer boundary.
    pub fn new(content_type: &str) -> TableResult<Self> {
        let boundary = boundary_param(content_type).ok_or_else(|| {
            invalid(format!(
                "Content-Type '{content_type}' is not multipart/mixed with a boundary"
            ))
        })?;
        Ok(Self { boundary })
    }

    pub fn parse(&self, body: &[u8]) -> TableResult<BatchTransactionContext> {
        let text = std::str::from_utf8(body).map_err(|_| invalid("body is not valid UTF-8"))?;
        let mut lines = Lines::new(text);

        let mut state = State::ExpectOuterBoundary;
        let mut batch_boundary = self.boundary.clone();
        let mut changeset_boundary: Option<String> = None;
        let mut outer_headers = Headers::new();
        let mut part = PendingPart::default();
        let mut operations: Vec<BatchOperation> = Vec::new();

        while state != State::Done {
            let line = lines.next().ok_or_else(|| invalid("body is truncated"))?;
            if state != State::ReadingSubRequestBody && line.contains('\n') {
                return Err(invalid("line endings must be CRLF"));
            }

            state = match state {
                State::ExpectOuterBoundary => {
                    if line.is_empty() {
                        continue;
                    }
                    let token = line
                        .strip_prefix("--")
                        .ok_or_else(|| invalid("expected the batch boundary"))?;
                    if token == format!("{batch_boundary}--") {
                        State::Done
                    } else if token == batch_boundary {
                        State::ExpectChangesetHeader
                    } else if token.starts_with("batch") && !token.ends_with("--") {
                        // Some clients declare one boundary and write another.
                        tracing::warn!(
                            declared = %batch_boundary,
                            actual = token,
                            "batch_boundary_mismatch"
                        );
                        batch_boundary = token.to_string();
                        State::ExpectChangesetHeader
                    } else {
                        return Err(invalid(format!("unexpected boundary '{token}'")));
                    }
                }

                State::ExpectChangesetHeader => {
                    if !line.is_empty() {
                        read_header(&mut outer_headers, line)?;
                        continue;
                    }
                    let content_type = outer_headers.get("content-type").unwrap_or_default();
                    if let Some(boundary) = boundary_param(content_type) {
                        changeset_boundary = Some(boundary);
                        State::ExpectChangesetBoundary
                    } else if is_http_part(content_type) {
                        part.part_headers = std::mem::take(&mut outer_headers);
                        State::ReadingRequestLine
                    } else {
                        return Err(invalid(format!(
                            "unsupported batch part Content-Type '{content_type}'"
                        )));
                    }
                }

                State::ExpectChangesetBoundary => {
                    if line.is_empty() {
                        continue;
                    }
                    let changeset = changeset_boundary.as_deref().unwrap_or_default();
                    match delimiter(line, changeset) {
                        Some(Delimiter::Next) => State::ReadingPartHeaders,
                        Some(Delimiter::Close) => State::ExpectChangesetClose,
                        None => return Err(invalid("expected the changeset boundary")),
                    }
                }

                State::ReadingPartHeaders => {
                    if !line.is_empty() {
                        read_header(&mut part.part_headers, line)?;
                        continue;
                    }
                    let content_type = part.part_headers.get("content-type").unwrap_or_default();
                    if !is_http_part(content_type) {
                        return Err(invalid(format!(
                            "changeset part Content-Type '{content_type}' is not application/http"
                        )));
                    }
                    State::ReadingRequestLine
                }

                State::ReadingRequestLine => {
                    if line.is_empty() {
                        continue;
                    }
                    part.request_line = Some(parse_request_line(line)?);
                    State::ReadingSubRequestHeaders
                }

                State::ReadingSubRequestHeaders => {
                    if line.is_empty() {
                        State::ReadingSubRequestBody
                    } else {
                        read_header(&mut part.headers, line)?;
                        continue;
                    }
                }

                State::ReadingSubRequestBody => {
                    let (boundary, in_changeset) = match &changeset_boundary {
                        Some(changeset) => (changeset.as_str(), true),
                        None => (batch_boundary.as_str(), false),
                    };
                    let Some(found) = delimiter(line, boundary) else {
                        part.body.push(line);
                        continue;
                    };
                    let operation = finish(std::mem::take(&mut part), in_changeset)?;
                    if operations.len() >= MAX_OPERATIONS {
                        return Err(TableError::TooManyOperationsInBatch {
                            limit: MAX_OPERATIONS,
                        });
                    }
                    operations.push(operation);
                    match (found, in_changeset) {
                        (Delimiter::Next, true) => State::ReadingPartHeaders,
                        (Delimiter::Close, true) => State::ExpectChangesetClose,
                        (Delimiter::Close, false) => State::Done,
                        (Delimiter::Next, false) => {
                            return Err(invalid("a batch holds one changeset or one retrieve"))
                        }
                    }
                }

                State::ExpectChangesetClose => {
                    if line.is_empty() {
                        continue;
                    }
                    match delimiter(line, &batch_boundary) {
                        Some(Delimiter::Close) => State::Done,
                        Some(Delimiter::Next) => {
                            return Err(invalid("a batch holds one changeset or one retrieve"))
                        }
                        None => return Err(invalid("expected the closing batch boundary")),
                    }
                }

                State::Done => State::Done,
            };
        }

        let table = same_table(&operations)?;
        let partition_key = same_partition(&operations)?;
        Ok(BatchTransactionContext {
            operations,
            partition_key,
            table,
            batch_boundary,
            changeset_boundary,
        })
    }
}

fn is_http_part(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|m| m.trim().eq_ignore_ascii_case("application/http"))
}

fn delimiter(line: &str, boundary: &str) -> Option<Delimiter> {
    let token = line.trim_end().strip_prefix("--")?.strip_prefix(boundary)?;
    match token {
        "" => Some(Delimiter::Next),
        "--" => Some(Delimiter::Close),
        _ => None,
    }
}

fn read_header(headers: &mut Headers, line: &str) -> TableResult<()> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| invalid(format!("malformed header line '{line}'")))?;
    if name.trim().is_empty() {
        return Err(invalid(format!("malformed header line '{line}'")));
    }
    headers.insert(name, value.trim());
    Ok(())
}

fn parse_request_line(line: &str) -> TableResult<(BatchVerb, String)> {
    let mut parts = line.split_whitespace();
    let (Some(verb), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid(format!("malformed request line '{line}'")));
    };
    if !version.starts_with("HTTP/") {
        return Err(invalid(format!("malformed request line '{line}'")));
    }
    let verb = BatchVerb::parse(verb)
        .ok_or_else(|| invalid(format!("unsupported sub-request method '{verb}'")))?;
    Ok((verb, target.to_string()))
}

fn finish(part: PendingPart<'_>, in_changeset: bool) -> TableResult<BatchOperation> {
    let (verb, target) = part
        .request_line
        .ok_or_else(|| invalid("sub-request has no request line"))?;
    let (_account, resource, query) = split_target(&target)?;
    let kind = OperationKind::select(verb, &resource).ok_or_else(|| {
        invalid(format!(
            "{} {target} is not a supported batch operation",
            verb.as_str()
        ))
    })?;
    if in_changeset && !kind.is_mutation() {
        return Err(invalid("retrieve operations cannot be part of a changeset"));
    }
    if !in_changeset && kind.is_mutation() {
        return Err(invalid("mutating operations must be inside a changeset"));
    }

    let content_id = part
        .part_headers
        .get("content-id")
        .or_else(|| part.headers.get("content-id"))
        .map(str::to_string);
    let body = part.body.join(CRLF).trim_end().as_bytes().to_vec();
    Ok(BatchOperation {
        verb,
        target,
        headers: part.headers,
        body,
        content_id,
        kind,
        resource,
        query,
    })
}

fn same_table(operations: &[BatchOperation]) -> TableResult<Option<String>> {
    let mut tables = operations.iter().map(BatchOperation::table);
    let Some(first) = tables.next() else {
        return Ok(None);
    };
    if let Some(other) = tables.find(|t| !t.eq_ignore_ascii_case(first)) {
        return Err(TableError::invalid_input(format!(
            "all operations in a batch must address one table ('{first}' and '{other}')"
        )));
    }
    Ok(Some(first.to_string()))
}

fn same_partition(operations: &[BatchOperation]) -> TableResult<Option<String>> {
    let mut partition_key: Option<String> = None;
    for operation in operations {
        let Some(pk) = operation.partition_key() else {
            continue;
        };
        match &partition_key {
            Some(existing) if *existing != pk => {
                return Err(TableError::MultiplePartitionKeysInBatch);
            }
            Some(_) => {}
            None => partition_key = Some(pk),
        }
    }
    Ok(partition_key)
}
