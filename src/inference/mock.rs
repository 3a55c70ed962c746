//! Scripted [`InferenceClient`] shared by the engine, oracle and pool tests.

use std::sync::Mutex;

use super::client::InferenceClient;
use super::error::InferenceError;
use super::types::{CallPurpose, InferenceRequest};

type Responder = dyn Fn(&InferenceRequest) -> Result<String, InferenceError> + Send + Sync;

pub struct MockClient {
    responder: Box<Responder>,
    calls: Mutex<Vec<InferenceRequest>>,
}

impl MockClient {
    pub fn new(
        responder: impl Fn(&InferenceRequest) -> Result<String, InferenceError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every verification says `verdict`; every other call echoes its purpose.
    pub fn with_verdict(verdict: &'static str) -> Self {
        Self::new(move |req| match req.purpose {
            CallPurpose::Verify => Ok(verdict.to_string()),
            other => Ok(format!("{other:?} reply")),
        })
    }

    pub fn calls(&self) -> Vec<InferenceRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, purpose: CallPurpose) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.purpose == purpose)
            .count()
    }
}

impl InferenceClient for MockClient {
    async fn complete(&self, req: &InferenceRequest) -> Result<String, InferenceError> {
        self.calls.lock().unwrap().push(req.clone());
        (self.responder)(req)
    }
}
