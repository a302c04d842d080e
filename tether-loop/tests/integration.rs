//! Dispatch-loop integration tests over a scripted provider and an
//! in-process mock tool server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use tether_context::ConversationState;
use tether_host::ServerHost;
use tether_host::test_util::{echo_reply, echo_tool_definition, ready_connection};
use tether_loop::{DispatchLoop, LoopConfig};
use tether_types::test_util::ScriptedProvider;
use tether_types::{
    CompletionResponse, FinishReason, LoopError, Role, ToolCall, Usage,
};

fn tool_call_response(calls: Vec<ToolCall>) -> CompletionResponse {
    CompletionResponse {
        text: String::new(),
        tool_calls: calls,
        usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        model: "scripted".into(),
        finish_reason: FinishReason::ToolCalls,
    }
}

fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        text: text.into(),
        tool_calls: vec![],
        usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        model: "scripted".into(),
        finish_reason: FinishReason::Stop,
    }
}

async fn echo_host() -> Arc<ServerHost> {
    let mut host = ServerHost::new(vec![]);
    host.insert(ready_connection("server", vec![echo_tool_definition()], echo_reply).await);
    Arc::new(host)
}

/// One tool round-trip: the model calls `server_echo`, the result
/// comes back, the follow-up completion produces the final text.
#[tokio::test]
async fn single_tool_round_trip() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![ToolCall::function("call_1", "server_echo", r#"{"x":"hi"}"#)]),
        text_response("hi!"),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let outcome = dispatch
        .run(&mut state, "say hi", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.response, "hi!");
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(outcome.follow_ups, 1);

    // Exactly one tool message, carrying the echoed content.
    let tool_messages: Vec<_> =
        state.messages().iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].content, "hi");
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
}

/// The advertised catalog reaches the provider with wire names.
#[tokio::test]
async fn provider_sees_wire_named_tools() {
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("done")]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    dispatch.run(&mut state, "hello", &CancellationToken::new()).await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "server_echo");
}

/// Zero tools configured: the provider still completes.
#[tokio::test]
async fn zero_tools_still_completes() {
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("fine")]));
    let host = Arc::new(ServerHost::new(vec![]));
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let outcome = dispatch.run(&mut state, "hi", &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.response, "fine");
    assert!(provider.requests()[0].tools.is_empty());
}

/// Bounded recursion: with max_follow_ups = 2, a model that keeps
/// calling tools gets exactly three completions and a cap note.
#[tokio::test]
async fn follow_up_cap_stops_the_loop() {
    let call = |id: &str| ToolCall::function(id, "server_echo", r#"{"x":"again"}"#);
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![call("c1")]),
        tool_call_response(vec![call("c2")]),
        tool_call_response(vec![call("c3")]),
        // Never reached: the cap stops after the third completion.
        text_response("unreachable"),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let outcome = dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();

    assert_eq!(provider.remaining(), 1);
    assert_eq!(outcome.follow_ups, 2);
    assert_eq!(outcome.tool_calls, 3);
    assert!(outcome.response.contains("follow-up limit"));
}

/// A failing tool call becomes an error-text tool message; the loop
/// continues to the follow-up completion.
#[tokio::test]
async fn tool_failure_becomes_tool_message() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![ToolCall::function("c1", "server_missing", "{}")]),
        text_response("recovered"),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider, host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let outcome = dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.response, "recovered");
    let tool_message = state
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("a tool message must exist even on failure");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_message.content.starts_with("Error:"));
}

/// Unparseable tool arguments also produce a tool message rather than
/// aborting the turn.
#[tokio::test]
async fn malformed_arguments_fail_only_that_call() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![
            ToolCall::function("bad", "server_echo", "[not an object]"),
            ToolCall::function("good", "server_echo", r#"{"x":"ok"}"#),
        ]),
        text_response("done"),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider, host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();

    let tool_contents: Vec<(&str, &str)> = state
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_call_id.as_deref().unwrap(), m.content.as_str()))
        .collect();
    assert_eq!(tool_contents.len(), 2);
    assert!(tool_contents[0].1.starts_with("Error:"));
    assert_eq!(tool_contents[1], ("good", "ok"));
}

/// A model that claims it will use a tool without calling one gets a
/// single tools-disabled completion.
#[tokio::test]
async fn claimed_tool_use_forces_final_answer() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        text_response("I'll use the echo tool to answer that."),
        text_response("The answer is 4."),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let outcome = dispatch.run(&mut state, "2+2?", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.response, "The answer is 4.");
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].tools.is_empty());
    assert!(requests[1].tools.is_empty(), "second completion must run with tools disabled");
}

/// Pairing invariant: every message set the provider receives has each
/// tool message preceded by the assistant message declaring its id.
#[tokio::test]
async fn transmitted_sets_are_always_paired() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![ToolCall::function("c1", "server_echo", r#"{"x":"a"}"#)]),
        tool_call_response(vec![ToolCall::function("c2", "server_echo", r#"{"x":"b"}"#)]),
        text_response("done"),
    ]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();

    for request in provider.requests() {
        let mut declared = std::collections::HashSet::new();
        for message in &request.messages {
            for call in &message.tool_calls {
                declared.insert(call.id.clone());
            }
            if message.role == Role::Tool {
                let id = message.tool_call_id.as_deref().unwrap();
                assert!(declared.contains(id), "unpaired tool message {id}");
            }
        }
    }
}

/// Cancellation surfaces as LoopError::Cancelled before any provider call.
#[tokio::test]
async fn cancellation_short_circuits() {
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("never")]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider.clone(), host, LoopConfig::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut state = ConversationState::new("sys");
    let err = dispatch.run(&mut state, "go", &cancel).await.unwrap_err();
    assert!(matches!(err, LoopError::Cancelled));
    assert!(provider.requests().is_empty());
}

/// The tool deadline from the loop config is respected end to end: a
/// deadline under the host's minimum slice fails the call eagerly, and
/// the failure is recorded as a tool message.
#[tokio::test]
async fn tight_tool_deadline_fails_call_not_turn() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![ToolCall::function("c1", "server_echo", r#"{"x":"hi"}"#)]),
        text_response("done anyway"),
    ]));
    let host = echo_host().await;
    let config = LoopConfig { tool_deadline: Duration::from_secs(1), ..LoopConfig::default() };
    let dispatch = DispatchLoop::new(provider, host, config);

    let mut state = ConversationState::new("sys");
    let outcome = dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.response, "done anyway");
    let tool_message =
        state.messages().iter().find(|m| m.role == Role::Tool).expect("tool message");
    assert!(tool_message.content.contains("insufficient time"));
}

/// Streaming dispatch delivers every completion's text to the sink in
/// order while producing the same outcome as the buffered path.
#[tokio::test]
async fn streaming_run_feeds_sink_across_follow_ups() {
    use tether_types::provider::CollectSink;

    let mut first = tool_call_response(vec![ToolCall::function(
        "c1",
        "server_echo",
        r#"{"x":"hi"}"#,
    )]);
    first.text = "Checking. ".into();
    let provider = Arc::new(ScriptedProvider::new(vec![first, text_response("hi!")]));
    let host = echo_host().await;
    let dispatch = DispatchLoop::new(provider, host, LoopConfig::default());

    let mut state = ConversationState::new("sys");
    let mut sink = CollectSink::default();
    let outcome = dispatch
        .run_streaming(&mut state, "say hi", &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.response, "hi!");
    // Both the intermediate and the final completion streamed.
    assert_eq!(sink.collected, "Checking. hi!");
}

/// JSON passed through the host is not rewritten: the mock server sees
/// the exact argument object.
#[tokio::test]
async fn arguments_reach_server_unchanged() {
    let seen: Arc<std::sync::Mutex<Vec<serde_json::Value>>> = Arc::default();
    let mut host = ServerHost::new(vec![]);
    host.insert(
        ready_connection("server", vec![echo_tool_definition()], {
            let seen = Arc::clone(&seen);
            move |_name, args| {
                seen.lock().unwrap().push(args.clone());
                json!({"content": [{"type": "text", "text": "ok"}]})
            }
        })
        .await,
    );

    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![ToolCall::function(
            "c1",
            "server_echo",
            r#"{"x":"hi","nested":{"deep":[1,2,3]}}"#,
        )]),
        text_response("done"),
    ]));
    let dispatch = DispatchLoop::new(provider, Arc::new(host), LoopConfig::default());

    let mut state = ConversationState::new("sys");
    dispatch.run(&mut state, "go", &CancellationToken::new()).await.unwrap();

    let observed = seen.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0], json!({"x": "hi", "nested": {"deep": [1, 2, 3]}}));
}
