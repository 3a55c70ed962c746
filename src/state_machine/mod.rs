mod record;
mod state;

pub use record::{
    AttemptRecord, ContentType, ErrorDetail, GUIDED_STEP, INITIAL_STEP, ResultStatus,
    SearchResult, Strategy, WorkItem,
};
pub use state::{SearchBudget, SearchRun, SearchState, StateMachine, StepEvent};
