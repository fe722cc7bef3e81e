//! Shared test utilities for the pipeline modules.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::llm::{LlmClient, LlmError, LlmRequest};

/// Mock LLM client with a pre-programmed queue of outcomes.
///
/// Outcomes are returned in FIFO order; when the queue runs dry,
/// subsequent calls fail with `InvalidRequest("mock queue exhausted")`.
pub(crate) struct ScriptedLlm {
    responses: Arc<Mutex<VecDeque<Result<String, LlmError>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    /// Creates a mock that replays `responses` in order.
    pub(crate) fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle for asserting how many requests reached the mock.
    pub(crate) fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn generate<'a>(
        &'a self,
        _request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.clone();
        Box::pin(async move {
            let next = responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Err(LlmError::InvalidRequest("mock queue exhausted".to_string()))
            })
        })
    }
}

/// Mock LLM client whose calls never complete. Used to verify that
/// cancellation wakes waiters instead of relying on call completion.
pub(crate) struct HangingLlm {
    calls: Arc<AtomicUsize>,
}

impl HangingLlm {
    pub(crate) fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl LlmClient for HangingLlm {
    fn generate<'a>(
        &'a self,
        _request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            std::future::pending::<()>().await;
            unreachable!("pending future resolved")
        })
    }
}

