use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Advisory tag steering the conclusion extractor toward domain phrasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    General,
    Ocr,
    Medical,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::General => write!(f, "general"),
            ContentType::Ocr => write!(f, "ocr"),
            ContentType::Medical => write!(f, "medical"),
        }
    }
}

/// Refinement strategies, applied round-robin in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Backtracking,
    ExploringNewPaths,
    Verification,
    Correction,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Backtracking,
        Strategy::ExploringNewPaths,
        Strategy::Verification,
        Strategy::Correction,
    ];

    /// Strategy for the `index`-th refinement call of a search.
    pub fn for_index(index: u32) -> Self {
        Self::ALL[index as usize % Self::ALL.len()]
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Backtracking => write!(f, "Backtracking"),
            Strategy::ExploringNewPaths => write!(f, "Exploring New Paths"),
            Strategy::Verification => write!(f, "Verification"),
            Strategy::Correction => write!(f, "Correction"),
        }
    }
}

/// Step label of the first proposal in an attempt history.
pub const INITIAL_STEP: &str = "Initial Analysis";
/// Step label of the answer-disclosing fallback in an attempt history.
pub const GUIDED_STEP: &str = "Guided Analysis";

/// One question/context/reference unit. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub context_images: Vec<String>,
    pub reference_answer: String,
    #[serde(default)]
    pub content_type: ContentType,
}

/// One proposal or refinement call and its verified outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub strategy_name: String,
    pub prompt_sent: String,
    pub raw_response: String,
    pub extracted_conclusion: String,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    /// The search for the item failed with an error.
    Error,
    /// The worker task itself died (panic) before producing a result.
    ErrorInFuture,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Error => write!(f, "error"),
            ResultStatus::ErrorInFuture => write!(f, "error_in_future"),
        }
    }
}

/// Failure detail kept on an errored result instead of dropping the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    /// Full error chain.
    pub detail: String,
}

/// Terminal, persisted outcome of processing one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub work_item_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub reference_answer: String,
    #[serde(default)]
    pub context_images: Vec<String>,
    #[serde(default)]
    pub final_answer: String,
    #[serde(default)]
    pub extracted_answer: String,
    #[serde(default)]
    pub natural_reasoning: String,
    #[serde(default)]
    pub strategies_used: Vec<String>,
    #[serde(default)]
    pub found_correct_answer: bool,
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
    #[serde(default)]
    pub query_history: Vec<String>,
    #[serde(default)]
    pub response_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SearchResult {
    /// An errored result for `item`, keeping its identity and inputs.
    pub fn failed(
        item: &WorkItem,
        status: ResultStatus,
        error: ErrorDetail,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            work_item_id: item.id.clone(),
            status,
            question: item.question.clone(),
            reference_answer: item.reference_answer.clone(),
            context_images: item.context_images.clone(),
            final_answer: String::new(),
            extracted_answer: String::new(),
            natural_reasoning: String::new(),
            strategies_used: Vec::new(),
            found_correct_answer: false,
            attempt_history: Vec::new(),
            query_history: Vec::new(),
            response_history: Vec::new(),
            error: Some(error),
            started_at,
            completed_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem {
            id: "case-1".into(),
            question: "What is seen?".into(),
            context_images: vec!["a.jpg".into()],
            reference_answer: "Pneumothorax".into(),
            content_type: ContentType::Medical,
        }
    }

    #[test]
    fn strategies_cycle_round_robin() {
        let names: Vec<_> = (0..6).map(Strategy::for_index).collect();
        assert_eq!(
            names,
            vec![
                Strategy::Backtracking,
                Strategy::ExploringNewPaths,
                Strategy::Verification,
                Strategy::Correction,
                Strategy::Backtracking,
                Strategy::ExploringNewPaths,
            ]
        );
        assert_eq!(Strategy::ExploringNewPaths.to_string(), "Exploring New Paths");
    }

    #[test]
    fn failed_result_keeps_item_identity() {
        let started = Utc::now();
        let result = SearchResult::failed(
            &item(),
            ResultStatus::Error,
            ErrorDetail {
                message: "timeout".into(),
                detail: "request timed out".into(),
            },
            started,
        );
        assert_eq!(result.work_item_id, "case-1");
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.context_images, vec!["a.jpg".to_string()]);
        assert!(!result.is_success());
        assert!(result.duration_ms >= 0);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::ErrorInFuture).unwrap(),
            r#""error_in_future""#
        );
        assert_eq!(ResultStatus::Success.to_string(), "success");
    }

    #[test]
    fn content_type_defaults_when_absent() {
        let json = r#"{"id": "x", "question": "q", "reference_answer": "a"}"#;
        let item: WorkItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.content_type, ContentType::General);
        assert!(item.context_images.is_empty());
    }

    #[test]
    fn error_field_is_omitted_on_success_shape() {
        let mut result = SearchResult::failed(
            &item(),
            ResultStatus::Success,
            ErrorDetail {
                message: String::new(),
                detail: String::new(),
            },
            Utc::now(),
        );
        result.error = None;
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("\"error\""));
    }
}
