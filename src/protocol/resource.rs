//! Resource addressing.
//!
//! Path-style addressing puts the account in the first path segment and the
//! resource in the rest:
//!
//! ```text
//! /{account}/Tables                                   table collection
//! /{account}/Tables('{name}')                         one table
//! /{account}/$batch                                   entity group transaction
//! /{account}/{table}  or  /{account}/{table}()        entity collection
//! /{account}/{table}(PartitionKey='..',RowKey='..')   one entity
//! ```

use percent_encoding::percent_decode_str;

use super::error::{TableError, TableResult};

const TABLES: &str = "Tables";
const BATCH: &str = "$batch";

/// An addressed resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Tables,
    Table(String),
    Batch,
    Entities {
        table: String,
    },
    Entity {
        table: String,
        partition_key: String,
        row_key: String,
    },
}

impl Resource {
    /// Parse a percent-decoded resource segment.
    pub fn parse(segment: &str) -> TableResult<Self> {
        let segment = segment.trim_end_matches('/');
        if segment.is_empty() {
            return Err(TableError::TableNameEmpty);
        }
        if segment == BATCH {
            return Ok(Resource::Batch);
        }

        let Some(open) = segment.find('(') else {
            return Ok(if segment == TABLES {
                Resource::Tables
            } else {
                Resource::Entities {
                    table: segment.to_string(),
                }
            });
        };

        let name = &segment[..open];
        let inner = segment[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| TableError::invalid_input(format!("unbalanced parentheses in '{segment}'")))?;
        if name.is_empty() {
            return Err(TableError::TableNameEmpty);
        }

        if name == TABLES {
            let table = parse_quoted(inner.trim())
                .map_err(TableError::invalid_input)?;
            if table.is_empty() {
                return Err(TableError::TableNameEmpty);
            }
            return Ok(Resource::Table(table));
        }

        if inner.trim().is_empty() {
            return Ok(Resource::Entities {
                table: name.to_string(),
            });
        }
        let (partition_key, row_key) =
            parse_key_predicate(inner).map_err(TableError::invalid_input)?;
        Ok(Resource::Entity {
            table: name.to_string(),
            partition_key,
            row_key,
        })
    }

    /// Table the resource belongs to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Resource::Table(table)
            | Resource::Entities { table }
            | Resource::Entity { table, .. } => Some(table),
            Resource::Tables | Resource::Batch => None,
        }
    }
}

/// Split `/{account}/{resource}` into its decoded parts.
pub fn split_path(path: &str) -> TableResult<(String, Resource)> {
    let path = path.trim_start_matches('/');
    let (account, rest) = path.split_once('/').unwrap_or((path, ""));
    if account.is_empty() {
        return Err(TableError::AccountNameEmpty);
    }
    let account = decode(account)?;
    let resource = Resource::parse(&decode(rest)?)?;
    Ok((account, resource))
}

/// Split a batch sub-request target, which is usually an absolute URL, into
/// `(account, resource, query)`.
pub fn split_target(target: &str) -> TableResult<(String, Resource, Option<String>)> {
    let without_scheme = match target.find("://") {
        Some(i) => {
            let after = &target[i + 3..];
            after.find('/').map_or("", |slash| &after[slash..])
        }
        None => target,
    };
    let (path, query) = match without_scheme.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (without_scheme, None),
    };
    let (account, resource) = split_path(path)?;
    Ok((account, resource, query))
}

fn decode(segment: &str) -> TableResult<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| TableError::invalid_input("request path is not valid UTF-8"))
}

/// Parse `PartitionKey='..',RowKey='..'` (either order).
fn parse_key_predicate(input: &str) -> Result<(String, String), String> {
    let mut partition_key = None;
    let mut row_key = None;
    let mut rest = input.trim();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("expected '=' in key predicate '{input}'"))?;
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let (value, consumed) = read_quoted(after)?;
        match name {
            "PartitionKey" => partition_key = Some(value),
            "RowKey" => row_key = Some(value),
            other => return Err(format!("unknown key '{other}' in key predicate")),
        }
        rest = after[consumed..].trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
            if rest.is_empty() {
                return Err("trailing ',' in key predicate".to_string());
            }
        } else if !rest.is_empty() {
            return Err(format!("unexpected '{rest}' in key predicate"));
        }
    }

    match (partition_key, row_key) {
        (Some(pk), Some(rk)) => Ok((pk, rk)),
        _ => Err(format!("key predicate '{input}' needs PartitionKey and RowKey")),
    }
}

fn parse_quoted(input: &str) -> Result<String, String> {
    let (value, consumed) = read_quoted(input)?;
    if input[consumed..].trim().is_empty() {
        Ok(value)
    } else {
        Err(format!("unexpected characters after literal in '{input}'"))
    }
}

/// Read a `'...'` literal (with `''` escapes) from the start of `input`; returns the
/// value and the number of bytes consumed.
fn read_quoted(input: &str) -> Result<(String, usize), String> {
    let mut chars = input.char_indices();
    if !matches!(chars.next(), Some((_, '\''))) {
        return Err(format!("expected quoted literal at '{input}'"));
    }
    let mut value = String::new();
    let mut chars = chars.peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                value.push('\'');
            } else {
                return Ok((value, i + 1));
            }
        } else {
            value.push(c);
        }
    }
    Err(format!("unterminated literal in '{input}'"))
}
