use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    thread::{self, JoinHandle},
    time::Duration,
};

use orchestrator::{
    error::HealthError,
    health::{HealthSource, HttpHealthClient},
};
use serde_json::json;

/// Serves `responses` in order, one per connection, then stops.
fn serve(responses: Vec<(u16, &'static str, String)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = thread::spawn(move || {
        let mut request_lines = Vec::new();
        for (code, reason, body) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            request_lines.push(request_line.trim_end().to_string());
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                if header == "\r\n" || header.is_empty() {
                    break;
                }
            }

            write!(
                stream,
                "HTTP/1.1 {code} {reason}\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
        }
        request_lines
    });

    (url, handle)
}

fn body(overall: &str, server: &str) -> String {
    json!({
        "status": overall,
        "summary": "",
        "components": [{
            "name": "server",
            "status": server,
            "message": "",
            "latency_ms": 2.5,
            "details": {"pid": 123, "log_path": "/tmp/server.log"}
        }],
        "seeds": [{"name": "default", "loaded": true}],
        "timestamp": "2026-01-01T00:00:00Z"
    })
    .to_string()
}

fn client(url: &str) -> HttpHealthClient {
    HttpHealthClient::new(url, Duration::from_secs(5)).unwrap()
}

#[test]
fn healthy_response_is_parsed_from_the_health_path() {
    let (url, server) = serve(vec![(200, "OK", body("healthy", "healthy"))]);

    let payload = client(&url).fetch().unwrap();

    assert!(payload.component_healthy("server"));
    assert_eq!(payload.component("server").unwrap().details.pid, Some(123));
    assert_eq!(server.join().unwrap(), vec!["GET /health HTTP/1.1"]);
}

#[test]
fn non_success_status_keeps_parsed_payload() {
    let (url, server) = serve(vec![(503, "Service Unavailable", body("unhealthy", "healthy"))]);

    match client(&url).fetch().unwrap_err() {
        HealthError::Unhealthy {
            status_code,
            payload,
            ..
        } => {
            assert_eq!(status_code, 503);
            assert!(payload.unwrap().component_healthy("server"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    server.join().unwrap();
}

#[test]
fn malformed_success_body_is_distinct_from_unhealthy() {
    let (url, server) = serve(vec![(200, "OK", "not json".to_string())]);

    assert!(matches!(
        client(&url).fetch(),
        Err(HealthError::Malformed(_))
    ));
    server.join().unwrap();
}

#[test]
fn component_readiness_over_http() {
    let (url, server) = serve(vec![
        (200, "OK", body("healthy", "healthy")),
        (503, "Service Unavailable", body("degraded", "starting")),
    ]);
    let client = client(&url);

    assert!(client.component_ready("server").is_ok());
    assert!(matches!(
        client.component_ready("server"),
        Err(HealthError::ComponentUnhealthy { ref status, .. }) if status == "starting"
    ));
    server.join().unwrap();
}

#[test]
fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    assert!(matches!(
        client(&url).fetch(),
        Err(HealthError::Transport(_))
    ));
}
