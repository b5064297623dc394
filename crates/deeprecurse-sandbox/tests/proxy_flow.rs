use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deeprecurse_sandbox::{
    BackendCall, BackendError, ReasoningBackend, SandboxConfig, SandboxLauncher, SandboxProxy,
    UnitState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeLauncher {
    starts: AtomicU32,
    running: AtomicBool,
    start_delay: Duration,
    late_backend: Option<(u16, &'static str)>,
}

#[async_trait]
impl SandboxLauncher for FakeLauncher {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        if let Some((port, body)) = self.late_backend {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                let listener = TcpListener::bind(("127.0.0.1", port))
                    .await
                    .expect("bind late backend");
                let _ = serve(listener, "200 OK", body).await;
            });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Backend {
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("reserve port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.expect("read request");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(chunk.get(..n).unwrap_or_default());
        let text = String::from_utf8_lossy(&buf);
        if let Some((head, rest)) = text.split_once("\r\n\r\n") {
            let length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if rest.len() >= length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn serve(listener: TcpListener, status: &'static str, body: &'static str) -> Backend {
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let backend = Backend {
        accepted: accepted.clone(),
        requests: requests.clone(),
    };
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let requests = requests.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                requests.lock().await.push(request);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    backend
}

fn config(port: u16, attempts: u32) -> SandboxConfig {
    let mut cfg = SandboxConfig::new("127.0.0.1", port);
    cfg.max_attempts = attempts;
    cfg.retry_delay = Duration::from_millis(20);
    cfg.request_timeout = Duration::from_secs(5);
    cfg
}

#[tokio::test]
async fn connection_refused_is_retried_up_to_bound() {
    let port = reserve_port().await;
    let launcher = Arc::new(FakeLauncher::default());
    let proxy = SandboxProxy::new(config(port, 3), launcher.clone()).expect("proxy");

    let err = proxy
        .call(BackendCall::new("", "2+2?", "t1"))
        .await
        .expect_err("nothing listens on the port");

    match err {
        BackendError::Unavailable {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(!last_error.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.state().await, UnitState::Starting);

    let stats = proxy.stats();
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.starts, 1);
    assert_eq!(stats.connect_failures, 3);
    assert_eq!(stats.unavailable, 1);
    assert_eq!(stats.api_errors, 0);
}

#[tokio::test]
async fn non_success_status_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let backend = serve(listener, "500 Internal Server Error", r#"{"error":"sandbox exploded"}"#).await;
    let proxy = SandboxProxy::new(config(port, 5), Arc::new(FakeLauncher::default())).expect("proxy");

    let err = proxy
        .call(BackendCall::new("", "q", "t1"))
        .await
        .expect_err("backend rejects the call");

    match err {
        BackendError::Api { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("sandbox exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.state().await, UnitState::Ready);

    let stats = proxy.stats();
    assert_eq!(stats.api_errors, 1);
    assert_eq!(stats.connect_failures, 0);
}

#[tokio::test]
async fn successful_call_posts_contract_body_and_returns_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let backend = serve(listener, "200 OK", r#"{"answer":"4"}"#).await;
    let proxy = SandboxProxy::new(config(port, 3), Arc::new(FakeLauncher::default())).expect("proxy");

    let answer = proxy
        .call(BackendCall::new("USER: hi\n", "2+2?", "t1"))
        .await
        .expect("answer");
    assert_eq!(answer, "4");

    let requests = backend.requests.lock().await;
    let request = requests.first().expect("one request");
    assert!(request.starts_with("POST /rlm HTTP/1.1"));
    let body = request.split("\r\n\r\n").nth(1).expect("body");
    let json: serde_json::Value = serde_json::from_str(body).expect("json body");
    assert_eq!(json["context"], "USER: hi\n");
    assert_eq!(json["query"], "2+2?");
    assert_eq!(json["thread_id"], "t1");
    assert_eq!(proxy.state().await, UnitState::Ready);
}

#[tokio::test]
async fn answer_must_be_a_string() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let _backend = serve(listener, "200 OK", r#"{"answer":4}"#).await;
    let proxy = SandboxProxy::new(config(port, 3), Arc::new(FakeLauncher::default())).expect("proxy");

    let err = proxy
        .call(BackendCall::new("", "q", "t1"))
        .await
        .expect_err("numeric answer");
    assert!(matches!(err, BackendError::InvalidResponse(_)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let _backend = serve(listener, "200 OK", r#"{"result":"4"}"#).await;
    let proxy = SandboxProxy::new(config(port, 3), Arc::new(FakeLauncher::default())).expect("proxy");
    let err = proxy
        .call(BackendCall::new("", "q", "t1"))
        .await
        .expect_err("missing answer");
    assert!(matches!(err, BackendError::InvalidResponse(_)));
}

#[tokio::test]
async fn slow_booting_unit_is_reached_after_retries() {
    let port = reserve_port().await;
    let launcher = Arc::new(FakeLauncher {
        late_backend: Some((port, r#"{"answer":"late"}"#)),
        ..FakeLauncher::default()
    });
    let proxy = SandboxProxy::new(config(port, 40), launcher.clone()).expect("proxy");

    let answer = proxy
        .call(BackendCall::new("", "q", "t1"))
        .await
        .expect("answer once booted");
    assert_eq!(answer, "late");
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_calls_start_the_unit_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let _backend = serve(listener, "200 OK", r#"{"answer":"ok"}"#).await;
    let launcher = Arc::new(FakeLauncher {
        start_delay: Duration::from_millis(50),
        ..FakeLauncher::default()
    });
    let proxy = Arc::new(SandboxProxy::new(config(port, 3), launcher.clone()).expect("proxy"));

    let mut handles = Vec::new();
    for i in 0..8 {
        let proxy = proxy.clone();
        handles.push(tokio::spawn(async move {
            proxy
                .call(BackendCall::new("", format!("q{i}"), "t1"))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("join").expect("answer"), "ok");
    }
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
}
