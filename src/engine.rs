use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{SearchConfig, render};
use crate::error::SearchError;
use crate::extract::extract_conclusion;
use crate::inference::{
    CallPurpose, InferenceClient, InferenceError, InferenceRequest, complete_within, retry_call,
};
use crate::oracle::{Transcript, VerificationOracle};
use crate::state_machine::{
    AttemptRecord, ErrorDetail, GUIDED_STEP, INITIAL_STEP, ResultStatus, SearchResult, SearchRun,
    SearchState, StateMachine, StepEvent, WorkItem,
};

/// The most recent proposal, waiting for its verdict.
#[derive(Debug, Default)]
struct Proposal {
    step: String,
    prompt: String,
    response: String,
}

/// Drives one [`WorkItem`] through the search state machine against an
/// inference client.
pub struct SearchEngine<C> {
    client: C,
    config: Arc<SearchConfig>,
}

impl<C: InferenceClient> SearchEngine<C> {
    pub fn new(client: C, config: Arc<SearchConfig>) -> Self {
        Self { client, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Run the search for `item` and fold any failure into an errored result.
    ///
    /// This is the per-item boundary: the returned record is tagged
    /// `Success` or `Error` and never loses the item's identity.
    pub async fn process_item(&self, item: &WorkItem) -> SearchResult {
        let started_at = Utc::now();
        match self.search(item).await {
            Ok(result) => result,
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "search failed");
                let message = err.to_string();
                let detail = format!("{:?}", anyhow::Error::new(err));
                SearchResult::failed(
                    item,
                    ResultStatus::Error,
                    ErrorDetail { message, detail },
                    started_at,
                )
            }
        }
    }

    /// Propose, verify and refine until the state machine reaches `Done`,
    /// then synthesize the narrative and final response.
    pub async fn search(&self, item: &WorkItem) -> Result<SearchResult, SearchError> {
        let started_at = Utc::now();
        let prompts = &self.config.prompts;
        let oracle = VerificationOracle::new(
            &self.client,
            prompts,
            self.config.text_max_tokens,
            self.timeout(),
        );

        let mut run = SearchRun::new(self.config.budget());
        let mut transcript = Transcript::default();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut strategies_used: Vec<String> = Vec::new();
        let mut proposal = Proposal::default();

        while !run.is_done() {
            debug!(item_id = %item.id, state = %run.state, "search step");
            match run.state {
                SearchState::Init => {
                    let prompt = render(&prompts.query_init, &[("question", &item.question)]);
                    let response = self
                        .generate(
                            CallPurpose::Initial,
                            &prompt,
                            item,
                            self.config.temperature,
                            &mut transcript,
                        )
                        .await?;
                    proposal = Proposal {
                        step: INITIAL_STEP.to_string(),
                        prompt,
                        response,
                    };
                    StateMachine::next(&mut run, StepEvent::Responded)?;
                }
                SearchState::Refine(strategy) => {
                    let prompt = render(
                        prompts.for_strategy(strategy),
                        &[("question", &item.question), ("response", &proposal.response)],
                    );
                    let response = self
                        .generate(
                            CallPurpose::Refine,
                            &prompt,
                            item,
                            self.config.strategy_temperature,
                            &mut transcript,
                        )
                        .await?;
                    strategies_used.push(strategy.to_string());
                    proposal = Proposal {
                        step: strategy.to_string(),
                        prompt,
                        response,
                    };
                    StateMachine::next(&mut run, StepEvent::Responded)?;
                }
                SearchState::GuidedFallback => {
                    let prompt = render(
                        &prompts.guided,
                        &[
                            ("question", &item.question),
                            ("response", &proposal.response),
                            ("reference", &item.reference_answer),
                        ],
                    );
                    let response = self
                        .generate(
                            CallPurpose::Guided,
                            &prompt,
                            item,
                            self.config.temperature,
                            &mut transcript,
                        )
                        .await?;
                    strategies_used.push(GUIDED_STEP.to_string());
                    proposal = Proposal {
                        step: GUIDED_STEP.to_string(),
                        prompt,
                        response,
                    };
                    StateMachine::next(&mut run, StepEvent::Responded)?;
                }
                SearchState::Verify => {
                    let verdict = oracle
                        .verify(
                            &proposal.response,
                            &item.reference_answer,
                            item.content_type,
                            &mut transcript,
                        )
                        .await?;
                    attempts.push(AttemptRecord {
                        strategy_name: std::mem::take(&mut proposal.step),
                        prompt_sent: std::mem::take(&mut proposal.prompt),
                        raw_response: proposal.response.clone(),
                        extracted_conclusion: verdict.conclusion,
                        verified: verdict.correct,
                    });
                    StateMachine::next(&mut run, StepEvent::Verified(verdict.correct))?;
                }
                SearchState::Done => break,
            }
        }

        let natural_reasoning = self.narrate(item, &attempts, &mut transcript).await;
        let final_prompt = render(
            &prompts.final_response,
            &[("reasoning", &natural_reasoning), ("question", &item.question)],
        );
        let final_answer = self
            .text_call(CallPurpose::Finalize, &final_prompt, &mut transcript)
            .await?;
        let extracted_answer = extract_conclusion(&final_answer, item.content_type);

        info!(
            item_id = %item.id,
            found_correct_answer = run.found_correct_answer,
            refinements = run.refinements,
            guided = run.guided,
            steps = run.state_history.len(),
            "search finished"
        );

        let completed_at = Utc::now();
        Ok(SearchResult {
            work_item_id: item.id.clone(),
            status: ResultStatus::Success,
            question: item.question.clone(),
            reference_answer: item.reference_answer.clone(),
            context_images: item.context_images.clone(),
            final_answer,
            extracted_answer,
            natural_reasoning,
            strategies_used,
            found_correct_answer: run.found_correct_answer,
            attempt_history: attempts,
            query_history: transcript.queries,
            response_history: transcript.responses,
            error: None,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
        })
    }

    /// Summarize the attempt transcript. A failed call degrades to the raw history.
    async fn narrate(
        &self,
        item: &WorkItem,
        attempts: &[AttemptRecord],
        transcript: &mut Transcript,
    ) -> String {
        let steps = attempts
            .iter()
            .map(|a| a.raw_response.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        let prompt = render(
            &self.config.prompts.natural_reasoning,
            &[("reasoning", &steps), ("question", &item.question)],
        );
        match self.text_call(CallPurpose::Narrate, &prompt, transcript).await {
            Ok(text) => text,
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "natural reasoning synthesis failed");
                format!("Could not synthesize natural reasoning. Raw history: {steps}")
            }
        }
    }

    /// Multimodal call with the item's images, under the bounded retry wrapper.
    async fn generate(
        &self,
        purpose: CallPurpose,
        prompt: &str,
        item: &WorkItem,
        temperature: f32,
        transcript: &mut Transcript,
    ) -> Result<String, InferenceError> {
        transcript.record_query(prompt);
        let req = InferenceRequest::generation(
            purpose,
            prompt.to_string(),
            &item.context_images,
            self.config.max_tokens,
            temperature,
        );
        let timeout = self.timeout();
        let response = retry_call(&self.config.retry, || {
            complete_within(&self.client, &req, timeout)
        })
        .await?;
        transcript.record_response(&response);
        Ok(response)
    }

    /// Deterministic text-only call, not retried.
    async fn text_call(
        &self,
        purpose: CallPurpose,
        prompt: &str,
        transcript: &mut Transcript,
    ) -> Result<String, InferenceError> {
        transcript.record_query(prompt);
        let req =
            InferenceRequest::text_only(purpose, prompt.to_string(), self.config.text_max_tokens);
        let response = complete_within(&self.client, &req, self.timeout()).await?;
        transcript.record_response(&response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RetryConfig;
    use crate::inference::mock::MockClient;
    use crate::state_machine::ContentType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(attempts: u32, depth: u32, efficient: bool) -> Arc<SearchConfig> {
        Arc::new(SearchConfig {
            max_search_attempts: attempts,
            max_search_depth: depth,
            efficient_search: efficient,
            retry: RetryConfig {
                max_retries: 0,
                base_delay_ms: 0,
            },
            ..SearchConfig::default()
        })
    }

    fn item() -> WorkItem {
        WorkItem {
            id: "case-7".into(),
            question: "Which bone is fractured?".into(),
            context_images: vec!["https://example.com/xray.jpg".into()],
            reference_answer: "Distal radius".into(),
            content_type: ContentType::Medical,
        }
    }

    #[tokio::test]
    async fn correct_first_proposal_skips_refinement() {
        let engine = SearchEngine::new(MockClient::with_verdict("True"), config(3, 1, true));
        let result = engine.search(&item()).await.unwrap();

        assert!(result.found_correct_answer);
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.attempt_history.len(), 1);
        assert_eq!(result.attempt_history[0].strategy_name, INITIAL_STEP);
        assert!(result.attempt_history[0].verified);
        assert!(result.strategies_used.is_empty());
        assert_eq!(result.final_answer, "Finalize reply");
        assert_eq!(result.natural_reasoning, "Narrate reply");

        let client = &engine.client;
        assert_eq!(client.count(CallPurpose::Initial), 1);
        assert_eq!(client.count(CallPurpose::Refine), 0);
        assert_eq!(client.count(CallPurpose::Verify), 1);
        assert_eq!(client.count(CallPurpose::Narrate), 1);
        assert_eq!(client.count(CallPurpose::Finalize), 1);
    }

    #[tokio::test]
    async fn always_incorrect_search_is_bounded() {
        let engine = SearchEngine::new(MockClient::with_verdict("False"), config(2, 2, true));
        let result = engine.search(&item()).await.unwrap();

        let client = &engine.client;
        assert_eq!(client.count(CallPurpose::Initial), 1);
        assert_eq!(client.count(CallPurpose::Refine), 4);
        assert_eq!(client.count(CallPurpose::Guided), 1);
        assert!(result.found_correct_answer, "guided fallback is correct by policy");
        assert_eq!(
            result.strategies_used,
            vec![
                "Backtracking",
                "Exploring New Paths",
                "Verification",
                "Correction",
                GUIDED_STEP
            ]
        );
        assert_eq!(result.attempt_history.len(), 6);
        assert!(!result.attempt_history.last().unwrap().verified);
    }

    #[tokio::test]
    async fn no_fallback_without_efficient_search() {
        let engine = SearchEngine::new(MockClient::with_verdict("False"), config(2, 2, false));
        let result = engine.search(&item()).await.unwrap();
        assert!(!result.found_correct_answer);
        assert_eq!(engine.client.count(CallPurpose::Refine), 4);
        assert_eq!(engine.client.count(CallPurpose::Guided), 0);
        assert_eq!(engine.client.count(CallPurpose::Finalize), 1);
    }

    #[tokio::test]
    async fn refinement_and_guided_prompts_embed_context() {
        let client = MockClient::new(|req| match req.purpose {
            CallPurpose::Initial => Ok("first draft".into()),
            CallPurpose::Verify => Ok("False".into()),
            other => Ok(format!("{other:?} reply")),
        });
        let engine = SearchEngine::new(client, config(1, 1, true));
        engine.search(&item()).await.unwrap();

        let calls = engine.client.calls();
        let refine = calls.iter().find(|c| c.purpose == CallPurpose::Refine).unwrap();
        assert!(refine.prompt.contains("Which bone is fractured?"));
        assert!(refine.prompt.contains("first draft"));
        assert_eq!(refine.images, vec!["https://example.com/xray.jpg".to_string()]);

        let guided = calls.iter().find(|c| c.purpose == CallPurpose::Guided).unwrap();
        assert!(guided.prompt.contains("Distal radius"));
        assert!(guided.prompt.contains("Refine reply"));
    }

    #[tokio::test]
    async fn attempt_history_is_ordered_and_transcript_complete() {
        let engine = SearchEngine::new(MockClient::with_verdict("False"), config(1, 1, false));
        let result = engine.search(&item()).await.unwrap();

        let names: Vec<_> = result
            .attempt_history
            .iter()
            .map(|a| a.strategy_name.as_str())
            .collect();
        assert_eq!(names, vec![INITIAL_STEP, "Backtracking"]);
        // initial, verify, refine, verify, narrate, finalize
        assert_eq!(result.query_history.len(), 6);
        assert_eq!(result.response_history.len(), 6);
    }

    #[tokio::test]
    async fn narrate_failure_degrades_to_raw_history() {
        let client = MockClient::new(|req| match req.purpose {
            CallPurpose::Narrate => Err(InferenceError::Timeout),
            CallPurpose::Verify => Ok("True".into()),
            other => Ok(format!("{other:?} reply")),
        });
        let engine = SearchEngine::new(client, config(1, 1, true));
        let result = engine.search(&item()).await.unwrap();
        assert!(
            result
                .natural_reasoning
                .starts_with("Could not synthesize natural reasoning. Raw history: Initial reply")
        );
        assert_eq!(result.final_answer, "Finalize reply");
    }

    #[tokio::test]
    async fn failed_generation_becomes_error_result() {
        let client = MockClient::new(|req| match req.purpose {
            CallPurpose::Initial => Err(InferenceError::ApiError {
                status: 500,
                message: "upstream down".into(),
            }),
            _ => Ok("True".into()),
        });
        let engine = SearchEngine::new(client, config(1, 1, true));
        let result = engine.process_item(&item()).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.work_item_id, "case-7");
        let error = result.error.unwrap();
        assert!(error.message.contains("upstream down"));
        assert!(error.detail.contains("upstream down"));
    }

    #[tokio::test]
    async fn generation_is_retried_within_bounds() {
        let failures = Arc::new(AtomicU32::new(0));
        let seen = failures.clone();
        let client = MockClient::new(move |req| match req.purpose {
            CallPurpose::Initial if seen.fetch_add(1, Ordering::SeqCst) == 0 => {
                Err(InferenceError::EmptyResponse)
            }
            CallPurpose::Verify => Ok("True".into()),
            other => Ok(format!("{other:?} reply")),
        });
        let mut cfg = (*config(1, 1, true)).clone();
        cfg.retry.max_retries = 1;
        let engine = SearchEngine::new(client, Arc::new(cfg));

        let result = engine.process_item(&item()).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(engine.client.count(CallPurpose::Initial), 2);
    }

    #[tokio::test]
    async fn verification_failure_is_not_an_incorrect_verdict() {
        let client = MockClient::new(|req| match req.purpose {
            CallPurpose::Verify => Err(InferenceError::Timeout),
            other => Ok(format!("{other:?} reply")),
        });
        let engine = SearchEngine::new(client, config(3, 1, true));
        let result = engine.process_item(&item()).await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(engine.client.count(CallPurpose::Refine), 0);
    }
}
