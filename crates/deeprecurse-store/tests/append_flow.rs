use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use deeprecurse_store::{ContextStore, FileContextStore, RemoteContextStore, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(1);

fn temp_root(label: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "deeprecurse-append-{label}-{}-{now}-{seq}",
        std::process::id()
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_on_one_key_never_interleave() {
    let root = temp_root("interleave");
    let store = Arc::new(FileContextStore::open(&root).expect("open store"));
    let a = "a".repeat(256 * 1024);
    let b = "b".repeat(256 * 1024);

    let first = {
        let store = store.clone();
        let a = a.clone();
        tokio::spawn(async move { store.append("shared", &a).await })
    };
    let second = {
        let store = store.clone();
        let b = b.clone();
        tokio::spawn(async move { store.append("shared", &b).await })
    };
    first.await.expect("join").expect("append a");
    second.await.expect("join").expect("append b");

    let log = store.read("shared").await.expect("read");
    let ab = format!("{a}{b}");
    let ba = format!("{b}{a}");
    assert!(log == ab || log == ba, "log interleaved");
    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_small_appends_all_land_intact() {
    let root = temp_root("many");
    let store = Arc::new(FileContextStore::open(&root).expect("open store"));

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.append("thread", &format!("line-{i}\n")).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("append");
    }

    let log = store.read("thread").await.expect("read");
    let mut lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 50);
    lines.sort_unstable();
    lines.dedup();
    assert_eq!(lines.len(), 50);
    assert!(lines.iter().all(|l| l.starts_with("line-")));
    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_are_independent() {
    let root = temp_root("keys");
    let store = Arc::new(FileContextStore::open(&root).expect("open store"));

    let mut handles = Vec::new();
    for key in ["alpha", "beta", "transcripts/s1"] {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.append(key, &format!("{key}\n")).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("append");
    }

    assert_eq!(store.read("alpha").await.expect("read"), "alpha\n");
    assert_eq!(store.read("beta").await.expect("read"), "beta\n");
    assert_eq!(
        store.read("transcripts/s1").await.expect("read"),
        "transcripts/s1\n"
    );
    let _ = std::fs::remove_dir_all(root);
}

async fn serve_once(listener: TcpListener, status: &'static str, body: &'static str) -> String {
    let (mut socket, _) = listener.accept().await.expect("accept");
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
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket
        .write_all(response.as_bytes())
        .await
        .expect("write response");
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn remote_store_speaks_http_contract() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve_once(listener, "200 OK", r#"{"context":"USER: q\n"}"#));

    let store = RemoteContextStore::new(format!("http://{addr}/"), Duration::from_secs(5))
        .expect("remote store");
    let context = store.read("transcripts/s1").await.expect("read");
    assert_eq!(context, "USER: q\n");

    let request = server.await.expect("join");
    assert!(request.starts_with("GET /store/context?key=transcripts%2Fs1 HTTP/1.1"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve_once(listener, "200 OK", r#"{"ok":true}"#));
    let store = RemoteContextStore::new(format!("http://{addr}"), Duration::from_secs(5))
        .expect("remote store");
    store.append("thread", "more\n").await.expect("append");
    let request = server.await.expect("join");
    assert!(request.starts_with("POST /store/append?key=thread HTTP/1.1"));
    assert!(request.contains(r#"{"text":"more\n"}"#));
}

#[tokio::test]
async fn remote_store_surfaces_non_success_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve_once(listener, "500 Internal Server Error", r#"{"error":"disk full"}"#));

    let store = RemoteContextStore::new(format!("http://{addr}"), Duration::from_secs(5))
        .expect("remote store");
    let err = store.append("thread", "x").await.expect_err("append must fail");
    match err {
        StoreError::Remote { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("disk full"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let _ = server.await;
}

#[tokio::test]
async fn remote_store_forwards_separator_and_lists_keys() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve_once(listener, "200 OK", r#"{"ok":true}"#));
    let store = RemoteContextStore::new(format!("http://{addr}"), Duration::from_secs(5))
        .expect("remote store");
    store
        .append_separated("t1", "\n", "USER: q\n")
        .await
        .expect("append");
    let request = server.await.expect("join");
    assert!(request.contains(r#""separator":"\n""#));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve_once(
        listener,
        "200 OK",
        r#"{"keys":["transcripts/s1","transcripts/s2"]}"#,
    ));
    let store = RemoteContextStore::new(format!("http://{addr}"), Duration::from_secs(5))
        .expect("remote store");
    let keys = store.list("transcripts/").await.expect("list");
    assert_eq!(keys, vec!["transcripts/s1", "transcripts/s2"]);
    let request = server.await.expect("join");
    assert!(request.starts_with("GET /store/keys?prefix=transcripts%2F HTTP/1.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_separated_appends_on_empty_key_stay_separated() {
    let root = temp_root("separated");
    let store = Arc::new(FileContextStore::open(&root).expect("open store"));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append_separated("same", "\n", &format!("USER: q{i}\nASSISTANT: a{i}\n"))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("append");
    }

    let log = store.read("same").await.expect("read");
    assert!(!log.starts_with('\n'));
    let blocks: Vec<&str> = log.split("\n\n").collect();
    assert_eq!(blocks.len(), 8);
    assert!(blocks.iter().all(|b| b.starts_with("USER: q")));
    let _ = std::fs::remove_dir_all(root);
}
