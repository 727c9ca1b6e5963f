//! Proxy channel framing tests against an in-process socket server.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use vpod_agent::{AgentCmd, AgentResponse, Proxy};
use vpod_proxy::CcProxy;
use vpod_shared::config::ProxyConfig;

/// Serve one connection, answering every request line with `reply`.
async fn serve_replies(listener: UnixListener, reply: &'static str) {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            // Every request must be a single JSON frame.
            let frame: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert!(frame["cmd"].is_string());

            stream
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            stream.flush().await.unwrap();
        }
    });
}

#[tokio::test]
async fn test_connect_mints_token_and_forwards_commands() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("proxy.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    serve_replies(listener, r#"{"token":"tok-1","result":"ok"}"#).await;

    let mut proxy = CcProxy::new(&ProxyConfig::default());
    let url = format!("unix://{}", socket.display());

    let token = proxy.connect("P1", &url, true).await.unwrap();
    assert_eq!(token.as_deref(), Some("tok-1"));

    let resp = proxy
        .send_cmd(AgentCmd::StartContainer {
            container_id: "c1".into(),
        })
        .await
        .unwrap();
    assert_eq!(resp, AgentResponse::Ok);
}

#[tokio::test]
async fn test_connect_without_token_request_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("proxy.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    serve_replies(listener, r#"{"result":"ok"}"#).await;

    let mut proxy = CcProxy::new(&ProxyConfig::default());
    let url = format!("unix://{}", socket.display());
    assert_eq!(proxy.connect("P1", &url, false).await.unwrap(), None);
}

#[tokio::test]
async fn test_connect_retry_gives_up_with_proxy_failure() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("unix://{}", dir.path().join("absent.sock").display());

    let mut proxy = CcProxy::new(&ProxyConfig::default());
    let started = std::time::Instant::now();
    let err = proxy.connect("P1", &url, false).await.unwrap_err();
    assert!(matches!(err, vpod_shared::Error::ProxyFailure(_)));
    // The retry loop runs against its 5 second budget.
    assert!(started.elapsed() >= std::time::Duration::from_secs(4));
}
