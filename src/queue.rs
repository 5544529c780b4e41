//! # Request Queue
//!
//! Bounded FIFO of admitted chat requests with per-request lifecycle and
//! retry accounting. Connection handlers are the producers; the single queue
//! worker is the consumer. Enqueue fails fast at capacity; retries re-enter
//! at the tail with an incremented attempt count.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;

/// Which client surface a request came from; selects the message formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Chat bot surface: edits one message with full accumulated content.
    Chat,
    /// Web UI: appends deltas to a growing message.
    Web,
}

/// An uploaded file reference with pre-extracted text content. Extraction
/// happens upstream; the core only threads the content through to prompts
/// and artifact detection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub extracted_content: String,
}

/// An admitted request waiting for, or undergoing, processing.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    pub message_id: Option<String>,
    pub channel_id: Option<String>,
    /// Channel holding the original user message, for reaction updates.
    pub message_channel_id: Option<String>,
    pub client_id: String,
    pub client_kind: ClientKind,
    pub attachments: Vec<AttachmentRef>,
    pub estimated_tokens: u64,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Per-request model override (e.g. a web UI model selector).
    pub model_override: Option<String>,
    pub cancel: CancellationToken,
}

impl QueuedRequest {
    /// Minimal request for tests and internal probes.
    pub fn test_request(user_id: &str, message: &str) -> Self {
        Self {
            request_id: String::new(),
            user_id: user_id.to_string(),
            conversation_id: format!("conv-{}", user_id),
            message: message.to_string(),
            message_id: None,
            channel_id: None,
            message_channel_id: None,
            client_id: "test-client".to_string(),
            client_kind: ClientKind::Chat,
            attachments: Vec::new(),
            estimated_tokens: 16,
            attempt: 0,
            enqueued_at: Utc::now(),
            model_override: None,
            cancel: CancellationToken::new(),
        }
    }
}

struct QueueInner {
    pending: VecDeque<QueuedRequest>,
    processing: HashMap<String, QueuedRequest>,
}

/// Bounded FIFO with retry bookkeeping. All operations are O(queue length)
/// or better and never block; the worker polls `dequeue`.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    max_size: usize,
    max_retries: u32,
}

impl RequestQueue {
    pub fn new(max_size: usize, max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                processing: HashMap::new(),
            }),
            max_size,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Admit a request. Assigns the server-side request id and returns it.
    pub fn enqueue(&self, mut request: QueuedRequest) -> Result<String, GatewayError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.pending.len() >= self.max_size {
            return Err(GatewayError::QueueFull {
                max_size: self.max_size,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        request.request_id = request_id.clone();
        request.enqueued_at = Utc::now();
        inner.pending.push_back(request);
        debug!(
            "📥 Enqueued request {} (depth {})",
            request_id,
            inner.pending.len()
        );
        Ok(request_id)
    }

    /// Pop the next request, transferring ownership to the worker until
    /// `mark_complete`/`mark_failed` resolves it.
    pub fn dequeue(&self) -> Option<QueuedRequest> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let request = inner.pending.pop_front()?;
        inner
            .processing
            .insert(request.request_id.clone(), request.clone());
        Some(request)
    }

    /// Resolve a request successfully.
    pub fn mark_complete(&self, request_id: &str) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.processing.remove(request_id);
    }

    /// Resolve a request with a failure. Requeues at the tail with an
    /// incremented attempt count while attempts remain; returns whether the
    /// request was requeued.
    pub fn mark_failed(&self, request_id: &str, error: &GatewayError) -> bool {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let Some(mut request) = inner.processing.remove(request_id) else {
            return false;
        };

        if error.is_retryable() && request.attempt < self.max_retries {
            request.attempt += 1;
            info!(
                "🔁 Requeueing {} (attempt {}/{}): {}",
                request_id, request.attempt, self.max_retries, error
            );
            inner.pending.push_back(request);
            true
        } else {
            info!(
                "❌ Request {} terminal after {} attempt(s): {}",
                request_id,
                request.attempt + 1,
                error
            );
            false
        }
    }

    /// Cancel a pending request. Returns false when the request is already
    /// being processed (in-flight cancellation is not supported here).
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if let Some(pos) = inner
            .pending
            .iter()
            .position(|r| r.request_id == request_id)
        {
            let request = inner.pending.remove(pos).expect("position just found");
            request.cancel.cancel();
            info!("🚫 Cancelled pending request {}", request_id);
            true
        } else {
            false
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue poisoned").pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    /// 1-based position among pending requests, `None` once dequeued.
    pub fn get_position(&self, request_id: &str) -> Option<usize> {
        let inner = self.inner.lock().expect("queue poisoned");
        inner
            .pending
            .iter()
            .position(|r| r.request_id == request_id)
            .map(|pos| pos + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RequestQueue {
        RequestQueue::new(3, 2)
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        let first = q.enqueue(QueuedRequest::test_request("u1", "first")).unwrap();
        let _second = q.enqueue(QueuedRequest::test_request("u2", "second")).unwrap();

        assert_eq!(q.dequeue().unwrap().request_id, first);
    }

    #[test]
    fn test_full_queue_fails_fast_then_recovers() {
        let q = queue();
        for i in 0..3 {
            q.enqueue(QueuedRequest::test_request("u", &format!("m{}", i)))
                .unwrap();
        }
        assert!(q.is_full());
        let err = q
            .enqueue(QueuedRequest::test_request("u", "overflow"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull { max_size: 3 }));

        // One dequeue frees exactly one admission slot.
        q.dequeue().unwrap();
        assert!(q.enqueue(QueuedRequest::test_request("u", "fits")).is_ok());
    }

    #[test]
    fn test_positions_are_one_based() {
        let q = queue();
        let a = q.enqueue(QueuedRequest::test_request("u", "a")).unwrap();
        let b = q.enqueue(QueuedRequest::test_request("u", "b")).unwrap();

        assert_eq!(q.get_position(&a), Some(1));
        assert_eq!(q.get_position(&b), Some(2));

        q.dequeue().unwrap();
        assert_eq!(q.get_position(&a), None);
        assert_eq!(q.get_position(&b), Some(1));
    }

    #[test]
    fn test_retry_cap() {
        let q = queue();
        let id = q.enqueue(QueuedRequest::test_request("u", "m")).unwrap();
        let err = GatewayError::Connection("refused".into());

        // attempt 0 -> requeue (1), attempt 1 -> requeue (2), attempt 2 -> terminal
        let mut dispatches = 0;
        loop {
            let request = q.dequeue().unwrap();
            dispatches += 1;
            if !q.mark_failed(&request.request_id, &err) {
                break;
            }
        }
        assert_eq!(dispatches, 3, "max_retries + 1 dispatches");
        assert_eq!(q.size(), 0);
        let _ = id;
    }

    #[test]
    fn test_non_retryable_error_is_terminal() {
        let q = queue();
        q.enqueue(QueuedRequest::test_request("u", "m")).unwrap();
        let request = q.dequeue().unwrap();

        let requeued = q.mark_failed(
            &request.request_id,
            &GatewayError::Config("missing model".into()),
        );
        assert!(!requeued);
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_requeued_request_re_enters_at_tail() {
        let q = queue();
        let first = q.enqueue(QueuedRequest::test_request("u", "first")).unwrap();
        let second = q.enqueue(QueuedRequest::test_request("u", "second")).unwrap();

        let request = q.dequeue().unwrap();
        assert_eq!(request.request_id, first);
        q.mark_failed(&request.request_id, &GatewayError::Connection("x".into()));

        assert_eq!(q.dequeue().unwrap().request_id, second);
        let retried = q.dequeue().unwrap();
        assert_eq!(retried.request_id, first);
        assert_eq!(retried.attempt, 1);
    }

    #[test]
    fn test_cancel_pending_only() {
        let q = queue();
        let id = q.enqueue(QueuedRequest::test_request("u", "m")).unwrap();
        assert!(q.cancel(&id));
        assert_eq!(q.size(), 0);

        let id = q.enqueue(QueuedRequest::test_request("u", "m")).unwrap();
        q.dequeue().unwrap();
        assert!(!q.cancel(&id), "in-flight requests cannot be cancelled");
    }

    #[test]
    fn test_mark_complete_clears_processing() {
        let q = queue();
        let id = q.enqueue(QueuedRequest::test_request("u", "m")).unwrap();
        let request = q.dequeue().unwrap();
        q.mark_complete(&request.request_id);

        // A late failure report for a completed request is ignored.
        assert!(!q.mark_failed(&id, &GatewayError::Connection("x".into())));
    }
}
