//! Scripted backend for tests

use crate::backend::{Backend, BackendKind, StreamRequest, TextSink};
use crate::error::Result;
use crate::result::{CanonicalResult, StopSignal, Usage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A backend that replays queued results in order. When the queue runs dry
/// it returns a plain text result, so open-ended loops still terminate.
pub struct MockBackend {
    kind: BackendKind,
    vision: bool,
    queue: Arc<Mutex<VecDeque<CanonicalResult>>>,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
}

impl MockBackend {
    /// Create a mock posing as the given backend kind.
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            vision: true,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Toggle whether the mock claims vision support.
    #[must_use]
    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    /// Queue a result to return on a future `stream` call.
    pub fn push_result(&self, result: CanonicalResult) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(result);
        }
    }

    /// Requests the mock has seen, in call order.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn default_result(model: &str) -> CanonicalResult {
        CanonicalResult {
            text: "Mock response".to_string(),
            tool_calls: Vec::new(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_tokens: None,
                cache_write_tokens: None,
            },
            stop: StopSignal::EndTurn,
            model: model.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    async fn stream(
        &self,
        request: StreamRequest,
        sink: &mut dyn TextSink,
    ) -> Result<CanonicalResult> {
        let model = request.model.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let result = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Self::default_result(&model));
        if !result.text.is_empty() {
            sink.text_delta(&result.text);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullSink;

    #[tokio::test]
    async fn queued_results_replay_in_order() {
        let mock = MockBackend::new(BackendKind::Native);
        mock.push_result(CanonicalResult {
            text: "first".into(),
            ..MockBackend::default_result("m")
        });
        mock.push_result(CanonicalResult {
            text: "second".into(),
            ..MockBackend::default_result("m")
        });

        let mut sink = NullSink;
        let request = StreamRequest::new("m", crate::SystemPrompt::Plain(String::new()), vec![]);
        let a = mock.stream(request.clone(), &mut sink).await.unwrap();
        let b = mock.stream(request.clone(), &mut sink).await.unwrap();
        let c = mock.stream(request, &mut sink).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(c.text, "Mock response");
    }

    #[tokio::test]
    async fn text_flows_through_the_sink() {
        let mock = MockBackend::new(BackendKind::Compat);
        let mut seen = String::new();
        let mut sink = |delta: &str| seen.push_str(delta);
        let request = StreamRequest::new("m", crate::SystemPrompt::Plain(String::new()), vec![]);
        mock.stream(request, &mut sink).await.unwrap();
        assert_eq!(seen, "Mock response");
    }
}
