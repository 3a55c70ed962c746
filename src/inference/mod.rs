pub mod client;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod retry;
pub mod types;

pub use client::{InferenceClient, OpenAiClient, complete_within};
pub use error::InferenceError;
pub use retry::{RetryConfig, retry_call};
pub use types::{CallPurpose, InferenceRequest};
