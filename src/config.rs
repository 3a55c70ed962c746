//! Configuration loaded from `cotsearch.toml`.
//!
//! [`SearchConfig`] holds every tunable of a run and is built once at
//! startup, then shared by reference. Missing keys fall back to defaults.
//! `OPENROUTER_API_KEY` (or `OPENAI_API_KEY`) takes precedence over the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::warn;

use crate::inference::RetryConfig;
use crate::state_machine::{ContentType, SearchBudget, Strategy};

/// Default file looked up in the working directory.
pub const CONFIG_FILE: &str = "cotsearch.toml";

/// Top-level configuration for a search run.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Inference service API key.
    #[serde(default)]
    pub api_key: String,

    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Multimodal model used for proposals, refinements and guided fallback.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Text-only model used for verification and synthesis.
    #[serde(default = "default_verifier_model")]
    pub verifier_model: String,

    /// Outer refinement rounds before giving up (or falling back).
    #[serde(default = "default_max_search_attempts")]
    pub max_search_attempts: u32,

    /// Refinement calls per outer round.
    #[serde(default = "default_max_search_depth")]
    pub max_search_depth: u32,

    /// Whether an exhausted search ends with the guided fallback step.
    #[serde(default = "default_efficient_search")]
    pub efficient_search: bool,

    /// Concurrent workers. Defaults to the available hardware parallelism.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Token limit for generation calls.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Token limit for verification and synthesis calls.
    #[serde(default = "default_text_max_tokens")]
    pub text_max_tokens: u32,

    /// Sampling temperature for the initial proposal and guided fallback.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Sampling temperature for refinement calls.
    #[serde(default = "default_strategy_temperature")]
    pub strategy_temperature: f32,

    /// Upper bound on a single inference call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bounded retry for generation calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory holding result stores and progress files.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Base directory for relative image paths in the dataset.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,

    /// Content type for dataset records that do not carry one.
    #[serde(default)]
    pub content_type: ContentType,

    /// Process at most this many dataset records.
    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub prompts: Prompts,
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model_name() -> String {
    "google/gemini-2.5-pro-preview-03-25".to_string()
}

fn default_verifier_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

fn default_max_search_attempts() -> u32 {
    3
}

fn default_max_search_depth() -> u32 {
    1
}

fn default_efficient_search() -> bool {
    true
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_tokens() -> u32 {
    20000
}

fn default_text_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    1.0
}

fn default_strategy_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: default_api_url(),
            model_name: default_model_name(),
            verifier_model: default_verifier_model(),
            max_search_attempts: default_max_search_attempts(),
            max_search_depth: default_max_search_depth(),
            efficient_search: default_efficient_search(),
            num_workers: default_num_workers(),
            max_tokens: default_max_tokens(),
            text_max_tokens: default_text_max_tokens(),
            temperature: default_temperature(),
            strategy_temperature: default_strategy_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryConfig::default(),
            results_dir: default_results_dir(),
            images_dir: None,
            content_type: ContentType::default(),
            limit: None,
            prompts: Prompts::default(),
        }
    }
}

impl SearchConfig {
    /// Loads `path`, or `cotsearch.toml` in the current directory when `None`.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        for var in ["OPENROUTER_API_KEY", "OPENAI_API_KEY"] {
            match std::env::var(var) {
                Ok(key) if !key.is_empty() => {
                    config.api_key = key;
                    break;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Rejects settings the pool or the state machine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            bail!("num_workers must be at least 1");
        }
        if self.max_search_depth == 0 {
            bail!("max_search_depth must be at least 1");
        }
        if self.api_url.trim().is_empty() {
            bail!("api_url must not be empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.content_type == ContentType::Ocr && self.max_search_attempts < 2 {
            warn!(
                max_search_attempts = self.max_search_attempts,
                "max_search_attempts >= 2 is recommended for OCR content"
            );
        }
        Ok(())
    }

    /// Search bounds handed to each state machine run.
    pub fn budget(&self) -> SearchBudget {
        SearchBudget {
            max_search_attempts: self.max_search_attempts,
            max_search_depth: self.max_search_depth,
            efficient_search: self.efficient_search,
        }
    }
}

/// Prompt templates. Placeholders are `{question}`, `{response}`,
/// `{reference}` and `{reasoning}`; unknown ones are left as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub query_init: String,
    pub verify: String,
    pub rethink_backtracking: String,
    pub rethink_exploring_new_paths: String,
    pub rethink_verification: String,
    pub rethink_correction: String,
    pub guided: String,
    pub natural_reasoning: String,
    pub final_response: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            query_init: "<question>\n{question}\n</question>\n\n\
                Answer the question above using the attached images. Reason step by step in \
                sections titled **Inner Thinking**, then give a **Final Conclusion** and a \
                **Verification** of that conclusion."
                .into(),
            verify: "Compare the response with the reference answer. Reply \"True\" if they \
                match in meaning, \"False\" otherwise.\n\nResponse: {response}\nReference: {reference}"
                .into(),
            rethink_backtracking: "<question>\n{question}\n</question>\n\n<previous reasoning>\n\
                {response}\n</previous reasoning>\n\nThe previous conclusion is wrong. Backtrack to \
                the step where the reasoning went astray and continue from there. End with a \
                **Final Conclusion**."
                .into(),
            rethink_exploring_new_paths: "<question>\n{question}\n</question>\n\n<previous reasoning>\n\
                {response}\n</previous reasoning>\n\nThe previous conclusion is wrong. Explore a \
                different line of reasoning from scratch. End with a **Final Conclusion**."
                .into(),
            rethink_verification: "<question>\n{question}\n</question>\n\n<previous reasoning>\n\
                {response}\n</previous reasoning>\n\nThe previous conclusion is wrong. Verify each \
                step against the images and fix what fails. End with a **Final Conclusion**."
                .into(),
            rethink_correction: "<question>\n{question}\n</question>\n\n<previous reasoning>\n\
                {response}\n</previous reasoning>\n\nThe previous conclusion is wrong. Correct the \
                specific errors and restate the answer. End with a **Final Conclusion**."
                .into(),
            guided: "<question>\n{question}\n</question>\n\n<previous reasoning>\n{response}\n\
                </previous reasoning>\n\n<hidden answer>\n{reference}\n</hidden answer>\n\n\
                Reconsider the previous reasoning so that it arrives at the hidden answer through \
                your own analysis. Do not mention that you were given the answer. End with a \
                **Final Conclusion**."
                .into(),
            natural_reasoning: "<reasoning steps>\n{reasoning}\n</reasoning steps>\n\n\
                <question>\n{question}\n</question>\n\nRewrite the reasoning steps as one natural, \
                first-person thought process that leads to the final answer."
                .into(),
            final_response: "<internal thinking>\n{reasoning}\n</internal thinking>\n\n\
                <question>\n{question}\n</question>\n\nUsing the internal thinking, write the final \
                answer to the question."
                .into(),
        }
    }
}

impl Prompts {
    /// Refinement template for `strategy`.
    pub fn for_strategy(&self, strategy: Strategy) -> &str {
        match strategy {
            Strategy::Backtracking => &self.rethink_backtracking,
            Strategy::ExploringNewPaths => &self.rethink_exploring_new_paths,
            Strategy::Verification => &self.rethink_verification,
            Strategy::Correction => &self.rethink_correction,
        }
    }
}

/// Substitutes named placeholders in a prompt template in a single pass,
/// so placeholder-like text inside substituted values is left alone.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let hit = vars.iter().find(|(name, _)| {
            tail[1..]
                .strip_prefix(name)
                .is_some_and(|after| after.starts_with('}'))
        });
        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 2..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
