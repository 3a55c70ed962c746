//! Verification oracle: asks the inference service whether a candidate
//! response agrees with the reference answer.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::config::{Prompts, render};
use crate::extract::{extract_conclusion, re};
use crate::inference::{
    CallPurpose, InferenceClient, InferenceError, InferenceRequest, complete_within,
};
use crate::state_machine::ContentType;

/// Every prompt sent and every reply received while processing one item.
/// Owned by that item's run and never shared across workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub queries: Vec<String>,
    pub responses: Vec<String>,
}

impl Transcript {
    pub fn record_query(&mut self, query: &str) {
        self.queries.push(query.to_string());
    }

    pub fn record_response(&mut self, response: &str) {
        self.responses.push(response.to_string());
    }
}

/// The oracle's judgement of one candidate response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub correct: bool,
    /// The span that was compared against the reference.
    pub conclusion: String,
}

pub struct VerificationOracle<'a, C> {
    client: &'a C,
    prompts: &'a Prompts,
    max_tokens: u32,
    timeout: Duration,
}

impl<'a, C: InferenceClient> VerificationOracle<'a, C> {
    pub fn new(client: &'a C, prompts: &'a Prompts, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            client,
            prompts,
            max_tokens,
            timeout,
        }
    }

    /// Judge `response` against `reference` with one zero-temperature call.
    ///
    /// The verification prompt and raw reply are appended to `transcript`.
    /// A failed call is returned as an error, never as an incorrect verdict.
    pub async fn verify(
        &self,
        response: &str,
        reference: &str,
        content_type: ContentType,
        transcript: &mut Transcript,
    ) -> Result<Verdict, InferenceError> {
        let conclusion = extract_conclusion(response, content_type);
        let query = render(
            &self.prompts.verify,
            &[("response", &conclusion), ("reference", reference)],
        );
        transcript.record_query(&query);

        let req = InferenceRequest::text_only(CallPurpose::Verify, query, self.max_tokens);
        let reply = complete_within(self.client, &req, self.timeout).await?;
        transcript.record_response(&reply);

        let correct = classify(&reply);
        debug!(correct, reply = %reply.trim(), "verification verdict");
        Ok(Verdict {
            correct,
            conclusion,
        })
    }
}

static TRUE_WORD: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)\btrue\b"));
static FALSE_WORD: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)\bfalse\b"));

/// `true` iff the reply has the word "true" and not the word "false".
/// Words that merely contain them ("untrue", "construed") do not count.
pub fn classify(reply: &str) -> bool {
    TRUE_WORD.is_match(reply) && !FALSE_WORD.is_match(reply)
}
