//! Loads the input dataset into [`WorkItem`]s.
//!
//! The file is a JSON array. Each record carries its question and reference
//! answer under either `question`/`answer` or the long-form
//! `"Open-ended Verifiable Question"`/`"Ground-True Answer"` keys, plus
//! optional `img_urls`, `id` and `content_type`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state_machine::{ContentType, WorkItem};

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(alias = "Open-ended Verifiable Question")]
    question: Option<String>,
    #[serde(alias = "Ground-True Answer")]
    answer: Option<String>,
    #[serde(default, alias = "image_urls", alias = "context_images")]
    img_urls: Vec<String>,
    #[serde(default)]
    content_type: Option<ContentType>,
}

/// Read `path` and normalise every well-formed record, keeping file order.
///
/// Records missing a question or answer are skipped with a warning.
/// `default_content_type` applies to records that do not name one.
pub fn load_work_items(
    path: &Path,
    default_content_type: ContentType,
    limit: Option<usize>,
) -> Result<Vec<WorkItem>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .with_context(|| format!("dataset {} is not a JSON array", path.display()))?;

    let mut items = Vec::with_capacity(records.len());
    for (index, value) in records.into_iter().enumerate() {
        if limit.is_some_and(|n| items.len() >= n) {
            break;
        }
        match normalize(index, value, default_content_type) {
            Some(item) => items.push(item),
            None => warn!(index, "skipping malformed dataset record"),
        }
    }

    info!(path = %path.display(), items = items.len(), "loaded dataset");
    Ok(items)
}

fn normalize(index: usize, value: serde_json::Value, default: ContentType) -> Option<WorkItem> {
    let raw: RawRecord = serde_json::from_value(value).ok()?;
    let question = raw.question.filter(|q| !q.trim().is_empty())?;
    let reference_answer = raw.answer?;

    let id = match raw.id {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => derive_id(index, &question),
    };

    Some(WorkItem {
        id,
        question,
        context_images: raw.img_urls,
        reference_answer,
        content_type: raw.content_type.unwrap_or(default),
    })
}

/// Stable id for a record without one: UUIDv5 over its position and question.
pub fn derive_id(index: usize, question: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{index}:{question}").as_bytes()).to_string()
}
