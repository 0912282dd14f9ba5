//! # Front-matter metadata
//!
//! Knowledge-base documents may start with a YAML front-matter block:
//!
//! ```text
//! ---
//! title: DMAIC
//! category: Methodology
//! tags: [define, measure]
//! ---
//! DMAIC is a data-driven improvement cycle...
//! ```
//!
//! [`extract`] splits such a document into a typed [`DocumentMetadata`] and the
//! residual body. Parsing never fails: a malformed block yields empty metadata.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Sentinel that opens and closes a front-matter block.
pub const FRONT_MATTER_SENTINEL: &str = "---";

/// Metadata attached to a document before it is chunked.
///
/// The well-known keys get named fields; anything else lands in `extra` as a
/// flat string map so new keys survive without a schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub category: Option<String>,
    /// Path of the document relative to the knowledge-base root. Injected by the
    /// caller, never read from the document itself.
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub last_updated: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl DocumentMetadata {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn title_or_empty(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    pub fn category_or_empty(&self) -> &str {
        self.category.as_deref().unwrap_or_default()
    }

    pub fn source_or_empty(&self) -> &str {
        self.source.as_deref().unwrap_or_default()
    }

    /// Fill every field that `self` leaves unset from `other`.
    ///
    /// Values already present on `self` win; `extra` keys are merged the same way.
    pub fn or(mut self, other: DocumentMetadata) -> Self {
        self.title = self.title.or(other.title);
        self.category = self.category.or(other.category);
        self.source = self.source.or(other.source);
        self.last_updated = self.last_updated.or(other.last_updated);
        if self.tags.is_empty() {
            self.tags = other.tags;
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
        self
    }

    fn from_mapping(mapping: &serde_yaml::Mapping) -> Self {
        let mut meta = DocumentMetadata::default();
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                debug!("Skipping non-string front-matter key: {:?}", key);
                continue;
            };
            match key {
                "title" => meta.title = scalar_to_string(value),
                "category" => meta.category = scalar_to_string(value),
                "last_updated" => meta.last_updated = scalar_to_string(value),
                "tags" => meta.tags = string_list(value),
                other => {
                    let flattened = match value {
                        Value::Sequence(_) => Some(string_list(value).join(", ")),
                        _ => scalar_to_string(value),
                    };
                    match flattened {
                        Some(v) => {
                            meta.extra.insert(other.to_string(), v);
                        }
                        None => debug!("Skipping nested front-matter value for key {}", other),
                    }
                }
            }
        }
        meta
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_to_string).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        other => scalar_to_string(other).into_iter().collect(),
    }
}

/// Split `text` into front-matter metadata and body.
///
/// - No leading sentinel: returns empty metadata and `text` unchanged.
/// - Leading sentinel without a closing one: same as above.
/// - Otherwise the block between the sentinels is parsed as YAML (empty metadata on
///   failure) and the body is everything after the closing sentinel, trimmed.
pub fn extract(text: &str) -> (DocumentMetadata, String) {
    if !text.starts_with(FRONT_MATTER_SENTINEL) {
        return (DocumentMetadata::default(), text.to_string());
    }

    let open = FRONT_MATTER_SENTINEL.len();
    let Some(close) = text[open..].find(FRONT_MATTER_SENTINEL).map(|i| i + open) else {
        warn!("Front-matter block is not terminated; treating document as plain text");
        return (DocumentMetadata::default(), text.to_string());
    };

    let block = &text[open..close];
    let body = text[close + FRONT_MATTER_SENTINEL.len()..].trim().to_string();

    let metadata = match serde_yaml::from_str::<Value>(block) {
        Ok(Value::Mapping(mapping)) => DocumentMetadata::from_mapping(&mapping),
        Ok(Value::Null) => DocumentMetadata::default(),
        Ok(other) => {
            warn!("Error parsing metadata: expected a mapping, got {:?}", other);
            DocumentMetadata::default()
        }
        Err(e) => {
            warn!("Error parsing metadata: {}", e);
            DocumentMetadata::default()
        }
    };

    (metadata, body)
}
