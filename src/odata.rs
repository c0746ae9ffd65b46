//! OData annotations and verbosity negotiation.
//!
//! Clients choose how much metadata they want through `Accept`
//! (`application/json;odata=nometadata|minimalmetadata|fullmetadata`) or the
//! `$format` query option. The annotator builds the `odata.metadata`, `odata.type`,
//! `odata.id` and `odata.editLink` strings for a verbosity level; fields a level
//! does not carry are left unset.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left unescaped by `encodeURIComponent`.
pub const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub const NO_METADATA: &str = "application/json;odata=nometadata";
pub const MINIMAL_METADATA: &str = "application/json;odata=minimalmetadata";
pub const FULL_METADATA: &str = "application/json;odata=fullmetadata";

/// Requested annotation detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    None,
    #[default]
    Minimal,
    Full,
}

impl Verbosity {
    /// Negotiate from an `Accept` header value.
    ///
    /// A missing header, `*/*` and bare `application/json` select minimal metadata.
    /// Returns `None` when no listed media range is a supported JSON format.
    pub fn from_accept(accept: Option<&str>) -> Option<Self> {
        let Some(accept) = accept.map(str::trim).filter(|a| !a.is_empty()) else {
            return Some(Verbosity::Minimal);
        };
        accept.split(',').find_map(Self::from_media_range)
    }

    /// Negotiate from a `$format` query value, which takes either a full media
    /// type or the bare level name.
    pub fn from_format(format: &str) -> Option<Self> {
        match format.trim() {
            "nometadata" => Some(Verbosity::None),
            "minimalmetadata" => Some(Verbosity::Minimal),
            "fullmetadata" => Some(Verbosity::Full),
            other => Self::from_media_range(other),
        }
    }

    fn from_media_range(range: &str) -> Option<Self> {
        let mut parts = range.split(';').map(str::trim);
        let media = parts.next()?.to_ascii_lowercase();
        if media == "*/*" {
            return Some(Verbosity::Minimal);
        }
        if media != "application/json" {
            return None;
        }
        for param in parts {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("odata") {
                return match value.trim().to_ascii_lowercase().as_str() {
                    "nometadata" => Some(Verbosity::None),
                    "minimalmetadata" => Some(Verbosity::Minimal),
                    "fullmetadata" => Some(Verbosity::Full),
                    _ => None,
                };
            }
        }
        Some(Verbosity::Minimal)
    }

    /// Response `Content-Type` for this level
    pub fn content_type(self) -> &'static str {
        match self {
            Verbosity::None => NO_METADATA,
            Verbosity::Minimal => MINIMAL_METADATA,
            Verbosity::Full => FULL_METADATA,
        }
    }

    fn has_metadata(self) -> bool {
        self != Verbosity::None
    }
}

/// Annotations for a table payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableAnnotations {
    pub metadata: Option<String>,
    pub odata_type: Option<String>,
    pub id: Option<String>,
    pub edit_link: Option<String>,
}

/// Annotations for an entity payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityAnnotations {
    pub metadata: Option<String>,
    pub odata_type: Option<String>,
    pub id: Option<String>,
    pub edit_link: Option<String>,
}

impl EntityAnnotations {
    /// Per-row annotations inside a listing, where the metadata link is carried once
    /// at the top level.
    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }
}

/// Annotations for a single table (create response).
pub fn for_table(
    _account: &str,
    _table_name: &str,
    url_prefix: &str,
    verbosity: Verbosity,
) -> TableAnnotations {
    TableAnnotations {
        metadata: verbosity
            .has_metadata()
            .then(|| format!("{url_prefix}/$metadata#Tables/@Element")),
        ..TableAnnotations::default()
    }
}

/// Top-level annotations for a table listing.
pub fn for_table_listing(url_prefix: &str, verbosity: Verbosity) -> TableAnnotations {
    TableAnnotations {
        metadata: verbosity
            .has_metadata()
            .then(|| format!("{url_prefix}/$metadata#Tables")),
        ..TableAnnotations::default()
    }
}

/// Row annotations for one table at full metadata.
pub fn for_table_entry(
    account: &str,
    table_name: &str,
    url_prefix: &str,
    verbosity: Verbosity,
) -> TableAnnotations {
    if verbosity != Verbosity::Full {
        return TableAnnotations::default();
    }
    let edit_link = format!("Tables('{}')", encode_key(table_name));
    TableAnnotations {
        metadata: None,
        odata_type: Some(format!("{account}.Tables")),
        id: Some(format!("{url_prefix}/{edit_link}")),
        edit_link: Some(edit_link),
    }
}

/// Annotations for a single entity.
pub fn for_entity(
    account: &str,
    table: &str,
    url_prefix: &str,
    partition_key: &str,
    row_key: &str,
    verbosity: Verbosity,
) -> EntityAnnotations {
    let mut annotations = EntityAnnotations {
        metadata: verbosity
            .has_metadata()
            .then(|| format!("{url_prefix}/$metadata#{table}/@Element")),
        ..EntityAnnotations::default()
    };
    if verbosity == Verbosity::Full {
        let edit_link = entity_path(table, partition_key, row_key);
        annotations.odata_type = Some(format!("{account}.{table}"));
        annotations.id = Some(format!("{url_prefix}/{edit_link}"));
        annotations.edit_link = Some(edit_link);
    }
    annotations
}

/// Top-level metadata link for an entity listing.
pub fn for_entity_listing(table: &str, url_prefix: &str, verbosity: Verbosity) -> Option<String> {
    verbosity
        .has_metadata()
        .then(|| format!("{url_prefix}/$metadata#{table}"))
}

/// `table(PartitionKey='..',RowKey='..')` with both keys escaped.
pub fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{table}(PartitionKey='{}',RowKey='{}')",
        encode_key(partition_key),
        encode_key(row_key)
    )
}

/// Quote-escape then URI-encode a key literal.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(&key.replace('\'', "''"), URI_COMPONENT).to_string()
}
