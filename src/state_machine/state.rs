use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::Strategy;
use crate::error::SearchError;

/// States of the propose → verify → refine search for one work item.
///
/// A search flows: INIT → VERIFY → (REFINE → VERIFY)* → (GUIDED_FALLBACK → VERIFY)? → DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Init,
    Verify,
    Refine(Strategy),
    GuidedFallback,
    Done,
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchState::Init => write!(f, "INIT"),
            SearchState::Verify => write!(f, "VERIFY"),
            SearchState::Refine(strategy) => write!(f, "REFINE({strategy})"),
            SearchState::GuidedFallback => write!(f, "GUIDED_FALLBACK"),
            SearchState::Done => write!(f, "DONE"),
        }
    }
}

/// What happened in the state just executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// The inference call of a proposing state returned.
    Responded,
    /// The oracle judged the latest response.
    Verified(bool),
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Advance to the next state.
    Next(SearchState),
    /// The search is over.
    Complete { found_correct_answer: bool },
}

/// Bounds on a single search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBudget {
    /// Outer rounds of refinement.
    pub max_search_attempts: u32,
    /// Refinement calls per outer round.
    pub max_search_depth: u32,
    /// End an exhausted search with the guided fallback.
    pub efficient_search: bool,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            max_search_attempts: 3,
            max_search_depth: 1,
            efficient_search: true,
        }
    }
}

/// Mutable bookkeeping of one search, advanced only by [`StateMachine::next`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRun {
    pub state: SearchState,
    pub budget: SearchBudget,
    /// Completed outer rounds.
    pub attempts: u32,
    /// Refinement calls made in the current outer round.
    pub depth: u32,
    /// Refinement calls made overall. Selects the next strategy.
    pub refinements: u32,
    /// Whether the guided fallback has run.
    pub guided: bool,
    pub found_correct_answer: bool,
    pub state_history: Vec<SearchState>,
}

impl SearchRun {
    pub fn new(budget: SearchBudget) -> Self {
        Self {
            state: SearchState::Init,
            budget,
            attempts: 0,
            depth: 0,
            refinements: 0,
            guided: false,
            found_correct_answer: false,
            state_history: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SearchState::Done
    }
}

/// Drives a [`SearchRun`] through the search states.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for `run` given what just happened.
    ///
    /// - Proposing states (`Init`, `Refine`, `GuidedFallback`) accept only
    ///   `Responded` and always move to `Verify`.
    /// - `Verify` accepts only `Verified`. A correct verdict completes the
    ///   search; otherwise it refines while outer rounds remain, then falls
    ///   back to `GuidedFallback` if enabled, else completes unsuccessfully.
    /// - After the guided fallback, the search completes as correct whatever
    ///   the verdict: the model was handed the answer.
    /// - `Done` is terminal and repeats its completion.
    pub fn next(run: &mut SearchRun, event: StepEvent) -> Result<Transition, SearchError> {
        let transition = match (run.state, event) {
            (SearchState::Init, StepEvent::Responded) => Transition::Next(SearchState::Verify),
            (SearchState::Refine(_), StepEvent::Responded) => {
                run.refinements += 1;
                run.depth += 1;
                if run.depth >= run.budget.max_search_depth {
                    run.attempts += 1;
                    run.depth = 0;
                }
                Transition::Next(SearchState::Verify)
            }
            (SearchState::GuidedFallback, StepEvent::Responded) => {
                run.guided = true;
                Transition::Next(SearchState::Verify)
            }
            (SearchState::Verify, StepEvent::Verified(correct)) => {
                Self::after_verdict(run, correct)
            }
            (SearchState::Done, _) => Transition::Complete {
                found_correct_answer: run.found_correct_answer,
            },
            (state, event) => return Err(SearchError::InvalidTransition { state, event }),
        };

        match transition {
            Transition::Next(next_state) => {
                run.state_history.push(run.state);
                run.state = next_state;
            }
            Transition::Complete {
                found_correct_answer,
            } => {
                if run.state != SearchState::Done {
                    run.state_history.push(run.state);
                    run.state = SearchState::Done;
                }
                run.found_correct_answer = found_correct_answer;
            }
        }

        Ok(transition)
    }

    fn after_verdict(run: &SearchRun, correct: bool) -> Transition {
        if correct || run.guided {
            Transition::Complete {
                found_correct_answer: true,
            }
        } else if run.attempts < run.budget.max_search_attempts {
            Transition::Next(SearchState::Refine(Strategy::for_index(run.refinements)))
        } else if run.budget.efficient_search {
            Transition::Next(SearchState::GuidedFallback)
        } else {
            Transition::Complete {
                found_correct_answer: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(attempts: u32, depth: u32, efficient: bool) -> SearchRun {
        SearchRun::new(SearchBudget {
            max_search_attempts: attempts,
            max_search_depth: depth,
            efficient_search: efficient,
        })
    }

    /// Feeds a fixed verdict until completion; returns (refinements, guided calls).
    fn drive(run: &mut SearchRun, verdict: bool) -> (u32, u32) {
        let mut refine_calls = 0;
        let mut guided_calls = 0;
        loop {
            let event = match run.state {
                SearchState::Verify => StepEvent::Verified(verdict),
                SearchState::Refine(_) => {
                    refine_calls += 1;
                    StepEvent::Responded
                }
                SearchState::GuidedFallback => {
                    guided_calls += 1;
                    StepEvent::Responded
                }
                SearchState::Init => StepEvent::Responded,
                SearchState::Done => break,
            };
            StateMachine::next(run, event).unwrap();
        }
        (refine_calls, guided_calls)
    }

    #[test]
    fn correct_first_answer_completes_immediately() {
        let mut run = run_with(3, 1, true);
        assert_eq!(
            StateMachine::next(&mut run, StepEvent::Responded).unwrap(),
            Transition::Next(SearchState::Verify)
        );
        assert_eq!(
            StateMachine::next(&mut run, StepEvent::Verified(true)).unwrap(),
            Transition::Complete {
                found_correct_answer: true
            }
        );
        assert!(run.is_done());
        assert_eq!(run.state_history, vec![SearchState::Init, SearchState::Verify]);
    }

    #[test]
    fn always_incorrect_is_bounded_by_attempts_times_depth() {
        let mut run = run_with(2, 2, true);
        let (refines, guided) = drive(&mut run, false);
        assert_eq!(refines, 4);
        assert_eq!(guided, 1);
        assert!(run.found_correct_answer, "guided fallback counts as correct");
    }

    #[test]
    fn without_efficient_search_there_is_no_fallback() {
        let mut run = run_with(2, 2, false);
        let (refines, guided) = drive(&mut run, false);
        assert_eq!(refines, 4);
        assert_eq!(guided, 0);
        assert!(!run.found_correct_answer);
    }

    #[test]
    fn zero_attempts_goes_straight_to_fallback() {
        let mut run = run_with(0, 2, true);
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        let t = StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap();
        assert_eq!(t, Transition::Next(SearchState::GuidedFallback));
    }

    #[test]
    fn refinement_strategies_rotate() {
        let mut run = run_with(5, 1, false);
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            match StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap() {
                Transition::Next(SearchState::Refine(s)) => seen.push(s),
                other => panic!("unexpected {other:?}"),
            }
            StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                Strategy::Backtracking,
                Strategy::ExploringNewPaths,
                Strategy::Verification,
                Strategy::Correction,
                Strategy::Backtracking,
            ]
        );
    }

    #[test]
    fn depth_counter_rolls_into_attempts() {
        let mut run = run_with(3, 2, false);
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap();
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        assert_eq!((run.attempts, run.depth), (0, 1));
        StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap();
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        assert_eq!((run.attempts, run.depth), (1, 0));
    }

    #[test]
    fn success_mid_refinement_stops_search() {
        let mut run = run_with(3, 2, true);
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap();
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        let t = StateMachine::next(&mut run, StepEvent::Verified(true)).unwrap();
        assert_eq!(
            t,
            Transition::Complete {
                found_correct_answer: true
            }
        );
        assert!(!run.guided);
        assert_eq!(run.refinements, 1);
    }

    #[test]
    fn mismatched_event_is_rejected() {
        let mut run = run_with(1, 1, true);
        let err = StateMachine::next(&mut run, StepEvent::Verified(true)).unwrap_err();
        assert!(matches!(
            err,
            SearchError::InvalidTransition {
                state: SearchState::Init,
                ..
            }
        ));
        assert_eq!(run.state, SearchState::Init);
    }

    #[test]
    fn done_is_terminal() {
        let mut run = run_with(0, 1, false);
        StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        StateMachine::next(&mut run, StepEvent::Verified(false)).unwrap();
        assert!(run.is_done());
        let t = StateMachine::next(&mut run, StepEvent::Responded).unwrap();
        assert_eq!(
            t,
            Transition::Complete {
                found_correct_answer: false
            }
        );
        assert_eq!(run.state_history.len(), 2);
    }

    #[test]
    fn state_display() {
        assert_eq!(SearchState::Init.to_string(), "INIT");
        assert_eq!(
            SearchState::Refine(Strategy::Correction).to_string(),
            "REFINE(Correction)"
        );
        assert_eq!(SearchState::GuidedFallback.to_string(), "GUIDED_FALLBACK");
        assert_eq!(SearchState::Done.to_string(), "DONE");
    }
}
