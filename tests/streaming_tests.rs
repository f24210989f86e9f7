//! Streamed turns: event ordering, parity with non-streamed output.

use std::sync::Arc;

use futures_util::StreamExt;

use docullm::clients::mock::{MockClient, MockStep};
use docullm::error::ErrorKind;
use docullm::function_registry::FunctionRegistry;
use docullm::orchestrator::{OrchestratorSettings, QueryOrchestrator, QueryRequest};
use docullm::streaming::{event_channel, StreamEvent};
use docullm::tools::{register_builtins, ToolCatalogOptions};

fn registry() -> Arc<FunctionRegistry> {
    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry, &ToolCatalogOptions::default()).unwrap();
    Arc::new(registry)
}

fn quality_script() -> Vec<MockStep> {
    vec![
        MockStep::CallTool {
            name: "analyze_document_quality".to_string(),
            arguments: serde_json::json!({"content": "# Title\n\nIntro."}),
        },
        MockStep::Reply("Quality grade: C".to_string()),
    ]
}

fn request() -> QueryRequest {
    QueryRequest {
        prompt: "summarize document quality".to_string(),
        document_content: Some("# Title\n\nIntro.".to_string()),
        ..QueryRequest::default()
    }
}

async fn collect_events(
    orchestrator: &QueryOrchestrator,
    request: &QueryRequest,
) -> Vec<StreamEvent> {
    let (tx, mut stream) = event_channel();
    let turn = orchestrator.stream(request, tx);
    let collector = async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    };
    let (_, events) = tokio::join!(turn, collector);
    events
}

#[tokio::test]
async fn streamed_text_matches_the_non_streamed_content() {
    // Two identical mocks: one drives the plain query, one the stream.
    let plain_mock = Arc::new(MockClient::new().with_script(quality_script()));
    let plain = QueryOrchestrator::new(plain_mock, registry());
    let expected = plain.query(&request()).await.unwrap().content;

    let stream_mock = Arc::new(MockClient::new().with_script(quality_script()));
    let streaming = QueryOrchestrator::new(stream_mock, registry());
    let events = collect_events(&streaming, &request()).await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text(piece) => Some(piece.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, expected);
    assert_eq!(expected, "Quality grade: C");
}

#[tokio::test]
async fn tool_using_stream_has_one_turn_boundary_and_one_done() {
    let mock = Arc::new(MockClient::new().with_script(quality_script()));
    let orchestrator = QueryOrchestrator::new(mock, registry());
    let events = collect_events(&orchestrator, &request()).await;

    let boundaries = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::TurnBoundary))
        .count();
    let dones = events.iter().filter(|e| matches!(e, StreamEvent::Done)).count();
    assert_eq!(boundaries, 1, "one sentinel between the two round-trips");
    assert_eq!(dones, 1, "exactly one done frame");
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    // Tool lifecycle events bracket the boundary.
    let started = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolCallStarted { .. }))
        .expect("tool start event");
    let completed = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolCallCompleted { .. }))
        .expect("tool completion event");
    let boundary = events
        .iter()
        .position(|e| matches!(e, StreamEvent::TurnBoundary))
        .unwrap();
    assert!(started < completed && completed < boundary);
}

#[tokio::test]
async fn plain_stream_emits_no_boundary() {
    let mock = Arc::new(
        MockClient::new().with_script(vec![MockStep::Reply("short answer".to_string())]),
    );
    let orchestrator = QueryOrchestrator::new(mock, registry());
    let req = QueryRequest {
        prompt: "hi".to_string(),
        ..QueryRequest::default()
    };
    let events = collect_events(&orchestrator, &req).await;
    assert!(events
        .iter()
        .all(|e| !matches!(e, StreamEvent::TurnBoundary)));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}

#[tokio::test]
async fn streams_never_short_circuit_through_the_cache() {
    // Warm the cache with a non-streamed identical request.
    let mock = Arc::new(MockClient::new().with_script(vec![
        MockStep::Reply("one".to_string()),
        MockStep::Reply("two".to_string()),
    ]));
    let orchestrator = QueryOrchestrator::new(mock.clone(), registry());
    let req = QueryRequest {
        prompt: "same input".to_string(),
        ..QueryRequest::default()
    };

    let plain = orchestrator.query(&req).await.unwrap();
    assert_eq!(plain.content, "one");
    assert_eq!(mock.calls(), 1);

    let events = collect_events(&orchestrator, &req).await;
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text(piece) => Some(piece.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "two", "the stream reflects a live provider call");
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn provider_failure_becomes_an_error_frame_not_a_done() {
    let mock = Arc::new(MockClient::new().with_script(vec![MockStep::Fail(
        ErrorKind::ProviderProtocol,
        "scripted protocol error".to_string(),
    )]));
    let orchestrator = QueryOrchestrator::new(mock, registry());
    let req = QueryRequest {
        prompt: "hi".to_string(),
        ..QueryRequest::default()
    };
    let events = collect_events(&orchestrator, &req).await;
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error {
            kind: ErrorKind::ProviderProtocol,
            ..
        })
    ));
    assert!(events.iter().all(|e| !matches!(e, StreamEvent::Done)));
}

#[tokio::test]
async fn exhausted_tool_budget_still_closes_the_stream() {
    let mock = Arc::new(MockClient::new().with_perpetual_tool_call(
        "extract_document_topics",
        serde_json::json!({"content": "loop"}),
    ));
    let orchestrator = QueryOrchestrator::new(mock.clone(), registry()).with_settings(
        OrchestratorSettings {
            max_tool_iterations: 2,
            ..OrchestratorSettings::default()
        },
    );
    let req = QueryRequest {
        prompt: "never stops".to_string(),
        ..QueryRequest::default()
    };

    let (tx, mut stream) = event_channel();
    let (result, events) = tokio::join!(orchestrator.stream(&req, tx), async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    });

    let response = result.unwrap();
    assert!(response.history_optimization_info.partial_tool_loop);
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert_eq!(mock.calls(), 3, "initial stream plus two follow-ups");
}
