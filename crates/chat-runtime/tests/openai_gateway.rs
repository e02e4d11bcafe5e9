use std::sync::Arc;
use std::time::Duration;

use chat_core::{
    driver::{ChannelSink, RoundDriver, TurnConfig},
    error::ChatError,
    event::StreamEvent,
    message::Message,
    provider::{ChatRequest, ModelGateway, ProviderEndpoint},
    watchdog::{CommandProbe, ModelJudge, Verdict, Watchdog},
};
use chat_runtime::{OpenAiConfig, OpenAiGateway, tools::default_tools};
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> ProviderEndpoint {
    ProviderEndpoint::new(server.uri(), "test-key")
}

fn sse(chunks: &[&str]) -> String {
    chunks.iter().map(|c| format!("data: {c}\n\n")).collect()
}

fn delta(text: &str) -> String {
    json!({"choices": [{"delta": {"content": text}}]}).to_string()
}

fn short_timeouts(secs: u64) -> OpenAiConfig {
    OpenAiConfig {
        timeout: Duration::from_secs(secs),
        read_timeout: Duration::from_secs(secs),
        connect_timeout: Duration::from_secs(secs),
    }
}

/// Consume one HTTP request, headers and body
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }
}

/// Serve one streaming response, sleeping before each frame
async fn trickle_server(frames: Vec<(Duration, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let head = b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        if socket.write_all(head).await.is_err() {
            return;
        }
        for (pause, frame) in frames {
            tokio::time::sleep(pause).await;
            if socket.write_all(frame.as_bytes()).await.is_err() || socket.flush().await.is_err() {
                return;
            }
        }
        let _ = socket.shutdown().await;
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn sync_completion_with_tool_calls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_string_contains("\"tools\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_current_time", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new().unwrap();
    let tools = default_tools("knowledge").openai_tools();
    let request = ChatRequest::new(endpoint(&server), "test-model", vec![Message::user("time?")]).with_tools(tools);

    let completion = gateway.complete(&request).await.unwrap();
    assert!(completion.content.is_empty());
    assert_eq!(completion.tool_calls.len(), 1);
    assert_eq!(completion.tool_calls[0].id, "call_1");
    assert_eq!(completion.tool_calls[0].name, "get_current_time");
}

#[tokio::test]
async fn streaming_skips_malformed_chunks_and_stops_at_done() {
    let server = MockServer::start().await;
    let body = sse(&[&delta("Hel"), "{not json", &delta("lo"), "[DONE]", &delta("late")]);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new().unwrap();
    let request = ChatRequest::new(endpoint(&server), "test-model", vec![Message::user("hi")]);

    let deltas: Vec<String> = gateway
        .complete_stream(&request)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
}

#[tokio::test]
async fn streaming_outlives_the_buffered_timeout_while_tokens_flow() {
    let mut frames: Vec<(Duration, String)> = (0..8)
        .map(|i| (Duration::from_millis(300), sse(&[&delta(&format!("t{i} "))])))
        .collect();
    frames.push((Duration::ZERO, sse(&["[DONE]"])));
    let base = trickle_server(frames).await;

    let gateway = OpenAiGateway::from_config(short_timeouts(1)).unwrap();
    let request = ChatRequest::new(ProviderEndpoint::new(base, "test-key"), "test-model", vec![Message::user("hi")]);

    let deltas: Vec<String> = gateway
        .complete_stream(&request)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(deltas.concat(), "t0 t1 t2 t3 t4 t5 t6 t7 ");
}

#[tokio::test]
async fn stalled_stream_ends_with_a_transport_error() {
    let base = trickle_server(vec![
        (Duration::ZERO, sse(&[&delta("partial")])),
        (Duration::from_secs(5), sse(&[&delta("too late")])),
    ])
    .await;

    let gateway = OpenAiGateway::from_config(short_timeouts(1)).unwrap();
    let request = ChatRequest::new(ProviderEndpoint::new(base, "test-key"), "test-model", vec![Message::user("hi")]);

    let items: Vec<_> = gateway.complete_stream(&request).await.unwrap().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().unwrap(), "partial");
    assert!(matches!(items[1], Err(ChatError::Transport { status: None, .. })));
}

#[tokio::test]
async fn final_line_without_newline_is_not_lost() {
    let server = MockServer::start().await;
    let body = format!("data: {}\n\ndata: {}", delta("Hel"), delta("lo"));

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new().unwrap();
    let request = ChatRequest::new(endpoint(&server), "test-model", vec![Message::user("hi")]);

    let deltas: Vec<String> = gateway
        .complete_stream(&request)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
}

#[tokio::test]
async fn non_success_status_is_a_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new().unwrap();
    let request = ChatRequest::new(endpoint(&server), "test-model", vec![Message::user("hi")]);

    let err = gateway.complete(&request).await.unwrap_err();
    match &err {
        ChatError::Transport { status, message } => {
            assert_eq!(*status, Some(503));
            assert!(message.contains("overloaded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.triggers_degrade());
}

#[tokio::test]
async fn unconfigured_endpoint_never_hits_the_network() {
    let gateway = OpenAiGateway::new().unwrap();
    let request = ChatRequest::new(ProviderEndpoint::new("", "key"), "m", vec![Message::user("hi")]);
    assert!(matches!(gateway.complete(&request).await, Err(ChatError::Config(_))));
}

#[tokio::test]
async fn driver_executes_a_tool_round_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_t",
                        "type": "function",
                        "function": {"name": "get_current_time", "arguments": "{\"timezone_hours\": 0}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("\"role\":\"tool\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "It is late."}, "finish_reason": "stop"}]
        })))
        .mount(&server)
        .await;

    let driver = RoundDriver::new(Arc::new(OpenAiGateway::new().unwrap()), Arc::new(default_tools("knowledge")));
    let config = TurnConfig::new(endpoint(&server), "test-model");

    let outcome = driver.run(&config, vec![Message::user("what time is it?")]).await.unwrap();
    assert_eq!(outcome.content, "It is late.");
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.tool_steps.len(), 1);
    assert_eq!(outcome.tool_steps[0].name, "get_current_time");
    assert!(outcome.tool_steps[0].result_full.contains("\"success\":true"));
}

#[tokio::test]
async fn rejected_tools_degrade_to_a_streamed_answer() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_string_contains("\"tools\""))
        .respond_with(ResponseTemplate::new(400).set_body_string("tools are not supported"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&[&delta("plain "), &delta("answer"), "[DONE]"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let driver = RoundDriver::new(Arc::new(OpenAiGateway::new().unwrap()), Arc::new(default_tools("knowledge")));
    let config = TurnConfig::new(endpoint(&server), "test-model");
    let (tx, mut rx) = mpsc::channel(16);
    let mut sink = ChannelSink::new(tx);

    let outcome = driver
        .drive(&config, vec![Message::user("hello")], &mut sink)
        .await
        .unwrap();
    drop(sink);

    assert!(outcome.degraded);
    assert_eq!(outcome.content, "plain answer");

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            StreamEvent::Content("plain ".into()),
            StreamEvent::Content("answer".into())
        ]
    );
}

#[tokio::test]
async fn judge_reads_stop_from_the_model() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_string_contains("\"max_tokens\":5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "STOP"}, "finish_reason": "stop"}]
        })))
        .mount(&server)
        .await;

    let judge = ModelJudge::new(Arc::new(OpenAiGateway::new().unwrap()), endpoint(&server), "judge");
    let probe = CommandProbe {
        command: "nc -l 4444".into(),
        elapsed: Duration::from_secs(60),
        ..CommandProbe::default()
    };
    assert_eq!(judge.classify(&probe).await, Verdict::Stop);
}

#[tokio::test]
async fn judge_fails_open_when_the_endpoint_is_unreachable() {
    let gateway = OpenAiGateway::new().unwrap();
    let judge = ModelJudge::new(
        Arc::new(gateway),
        ProviderEndpoint::new("http://127.0.0.1:9", "test-key"),
        "judge",
    )
    .with_timeout(Duration::from_secs(5));

    let probe = CommandProbe {
        command: "sleep 100".into(),
        ..CommandProbe::default()
    };
    assert_eq!(judge.classify(&probe).await, Verdict::Continue);
}
