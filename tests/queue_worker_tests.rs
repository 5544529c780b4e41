//! End-to-end worker runs against the stubbed backend: streamed happy path,
//! empty-stream retry in non-streaming mode, and terminal failure frames.

mod common;

use std::time::Duration;

use common::{build_state, StubBackend};
use modelmux::queue::QueuedRequest;
use modelmux::worker::{QueueWorker, WorkerSettings};
use modelmux::ws::OutboundFrame;
use tokio_util::sync::CancellationToken;

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        enable_streaming: true,
        chat_chunk_interval: Duration::ZERO,
        web_chunk_interval: Duration::ZERO,
        empty_stream_retries: 3,
    }
}

fn chat_request(client_id: &str, message: &str) -> QueuedRequest {
    let mut request = QueuedRequest::test_request("user-1", message);
    request.client_id = client_id.to_string();
    request.channel_id = Some("channel-1".to_string());
    request.message_id = Some("message-1".to_string());
    request
}

async fn collect_until_terminal(
    rx: &mut tokio::sync::mpsc::Receiver<OutboundFrame>,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for frames")
            .expect("fanout channel closed");
        let terminal = matches!(
            &frame,
            OutboundFrame::StreamChunk { is_complete: true, .. }
                | OutboundFrame::Response { .. }
                | OutboundFrame::Failed { .. }
                | OutboundFrame::Error { .. }
        );
        frames.push(frame);
        if terminal {
            return frames;
        }
    }
}

#[tokio::test]
async fn streamed_request_completes_with_single_terminal_chunk() {
    let backend = StubBackend::start().await;
    backend.mount_router("SELF_HANDLE", "NO").await;
    backend
        .mount_streaming_generation("Hello! Here is a streamed answer with plenty of content.")
        .await;

    let (state, _alerts) = build_state(&backend.uri(), 60.0);
    let mut client_rx = state.fanout.register("bot-1");

    state
        .queue
        .enqueue(chat_request("bot-1", "hi there"))
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = QueueWorker::new(
        state.queue.clone(),
        state.orchestrator.clone(),
        state.profiles.clone(),
        state.vram.clone(),
        state.fanout.clone(),
        state.metrics.clone(),
        worker_settings(),
        shutdown.clone(),
    )
    .spawn();

    let frames = collect_until_terminal(&mut client_rx).await;
    shutdown.cancel();
    let _ = worker.await;

    assert!(matches!(frames[0], OutboundFrame::Processing { .. }));

    let terminal: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, OutboundFrame::StreamChunk { is_complete: true, .. }))
        .collect();
    assert_eq!(terminal.len(), 1, "exactly one terminal stream chunk");
    match terminal[0] {
        OutboundFrame::StreamChunk { content, error, .. } => {
            assert!(content.contains("streamed answer"));
            assert!(!error);
        }
        _ => unreachable!(),
    }

    let snapshot = state.metrics.snapshot();
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.failed_requests, 0);
}

#[tokio::test]
async fn empty_stream_retries_in_non_streaming_mode() {
    let backend = StubBackend::start().await;
    backend.mount_router("SELF_HANDLE", "NO").await;
    // Streaming yields nothing; the buffered path has the real answer.
    backend.mount_streaming_generation("").await;
    backend
        .mount_buffered_generation("Recovered answer via the non-streaming path.")
        .await;

    let (state, _alerts) = build_state(&backend.uri(), 60.0);
    let mut client_rx = state.fanout.register("bot-1");

    state
        .queue
        .enqueue(chat_request("bot-1", "please answer"))
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = QueueWorker::new(
        state.queue.clone(),
        state.orchestrator.clone(),
        state.profiles.clone(),
        state.vram.clone(),
        state.fanout.clone(),
        state.metrics.clone(),
        worker_settings(),
        shutdown.clone(),
    )
    .spawn();

    let frames = collect_until_terminal(&mut client_rx).await;
    shutdown.cancel();
    let _ = worker.await;

    // A retry status chunk announced the non-streaming attempt.
    let retry_chunks = frames
        .iter()
        .filter(|f| match f {
            OutboundFrame::StreamChunk { content, .. } => {
                content.contains("Retrying with non-streaming mode")
            }
            _ => false,
        })
        .count();
    assert!(
        (1..=3).contains(&retry_chunks),
        "expected 1-3 retry status chunks, got {}",
        retry_chunks
    );

    // Exactly one terminal chunk, carrying the recovered content.
    let terminal: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            OutboundFrame::StreamChunk {
                is_complete: true,
                content,
                error,
                ..
            } => Some((content.clone(), *error)),
            _ => None,
        })
        .collect();
    assert_eq!(terminal.len(), 1);
    assert!(terminal[0].0.contains("Recovered answer"));
    assert!(!terminal[0].1);
}

#[tokio::test]
async fn generation_failure_exhausts_retries_then_fails() {
    let backend = StubBackend::start().await;
    backend.mount_router("SELF_HANDLE", "NO").await;

    let (state, _alerts) = build_state(&backend.uri(), 60.0);
    let mut client_rx = state.fanout.register("bot-1");

    // Every generation attempt gets a structured backend failure.
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/chat"))
        .and(wiremock::matchers::body_string_contains("helpful chat assistant"))
        .respond_with(wiremock::ResponseTemplate::new(500).set_body_string("model exploded"))
        .mount(&backend.server)
        .await;

    state
        .queue
        .enqueue(chat_request("bot-1", "boom please"))
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = QueueWorker::new(
        state.queue.clone(),
        state.orchestrator.clone(),
        state.profiles.clone(),
        state.vram.clone(),
        state.fanout.clone(),
        state.metrics.clone(),
        worker_settings(),
        shutdown.clone(),
    )
    .spawn();

    // Generation errors are retryable: the request is dispatched
    // max_retries + 1 times before the failed frame goes out.
    let mut failed_frame = None;
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_secs(15), client_rx.recv()).await {
            Ok(Some(OutboundFrame::Failed {
                attempts, error, ..
            })) => {
                failed_frame = Some((attempts, error));
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    shutdown.cancel();
    let _ = worker.await;

    let (attempts, error) = failed_frame.expect("expected a failed frame");
    assert_eq!(attempts, 3, "max_retries + 1 dispatches");
    assert!(error.contains("model exploded") || error.contains("Generation"));
}
