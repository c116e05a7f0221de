//! Coverage for the client session driving a real upload end-to-end, for
//! client-initiated abort cleaning up server-side staging, and for the
//! timeout sweep only affecting the connection that actually went idle.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dync_core::{ClientSession, FlowConfig, Server};
use dync_storage::{DropboxConfig, DropboxRule, Storage};
use dync_transport::codec::{decode_frames, encode_frames};
use dync_transport::{Authenticator, CertificateDirectory, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const TOKEN: &str = "test-token";

struct TestServer {
    addr: SocketAddr,
    staging: TempDir,
    dest: TempDir,
}

async fn spawn_server_with_timeout(timeout_secs: u64) -> TestServer {
    let staging = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let config = DropboxConfig {
        path: dest.path().to_path_buf(),
        manual: dest.path().to_path_buf(),
        dropboxes: vec![DropboxRule {
            regexp: ".*".to_string(),
            path: dest.path().to_path_buf(),
            origin: None,
            match_file: true,
            match_dir: false,
            requires_barcode: false,
        }],
    };

    let mut certs = CertificateDirectory::empty();
    certs.insert(TOKEN, "test-client");
    let auth = Arc::new(Authenticator::spawn(certs));

    let storage = Storage::new(staging.path().to_path_buf(), config);
    let router = Router::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(1024);

    let accept_router = router.clone();
    tokio::spawn(async move {
        let _ = accept_router.serve_listener(listener, tx, auth).await;
    });

    let mut flow = FlowConfig::default();
    flow.timeout_secs = timeout_secs;
    let mut server = Server::new(router, storage, flow, rx);
    tokio::spawn(async move {
        server.serve().await;
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    TestServer {
        addr,
        staging,
        dest,
    }
}

fn staged_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn client_session_completes_full_upload_against_live_server() {
    let server = spawn_server_with_timeout(3600).await;

    // Several chunks' worth of data so the client's send loop runs more than
    // once before the final, short chunk.
    let payload: Vec<u8> = (0..300_000u32).map(|n| (n % 256) as u8).collect();
    let source = Cursor::new(payload.clone());

    let mut session = ClientSession::connect(
        server.addr,
        TOKEN,
        "big.raw".to_string(),
        json!({"passthrough": "lab_a"}),
        source,
    )
    .await
    .unwrap();

    let upload_id = session.run().await.unwrap();
    assert_eq!(upload_id.len(), 32);

    let landed = server.dest.path().join("lab_a").join("big.raw");
    let landed_bytes = tokio::fs::read(&landed).await.unwrap();
    assert_eq!(landed_bytes, payload);
}

#[tokio::test]
async fn client_abort_cleans_up_server_side_staging() {
    let server = spawn_server_with_timeout(3600).await;
    let source = Cursor::new(vec![0u8; 1024]);

    let mut session = ClientSession::connect(
        server.addr,
        TOKEN,
        "abandoned.raw".to_string(),
        json!({"passthrough": "lab_a"}),
        source,
    )
    .await
    .unwrap();

    assert_eq!(staged_entries(server.staging.path()), 1);

    session.abort().await.unwrap();

    // Give the server a moment to process the client's error message.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(staged_entries(server.staging.path()), 0);
    assert!(!server
        .dest
        .path()
        .join("lab_a")
        .join("abandoned.raw")
        .exists());
}

struct RawClient {
    stream: Framed<TcpStream, LengthDelimitedCodec>,
}

impl RawClient {
    async fn connect(addr: SocketAddr, token: &str) -> Self {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = Framed::new(tcp, LengthDelimitedCodec::new());
        stream
            .send(Bytes::from(token.as_bytes().to_vec()))
            .await
            .unwrap();
        RawClient { stream }
    }

    async fn send(&mut self, frames: &[Bytes]) {
        self.stream.send(encode_frames(frames)).await.unwrap();
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<Vec<Bytes>> {
        match tokio::time::timeout(wait, self.stream.next()).await {
            Ok(Some(frame)) => Some(decode_frames(frame.unwrap().freeze()).unwrap()),
            Ok(None) => None,
            Err(_elapsed) => None,
        }
    }
}

fn post_file(name: &str) -> Vec<Bytes> {
    vec![
        Bytes::from_static(b"post-file"),
        Bytes::from(0u32.to_be_bytes().to_vec()),
        Bytes::from(name.as_bytes().to_vec()),
        Bytes::from(serde_json::to_vec(&json!({"passthrough": "lab_a"})).unwrap()),
    ]
}

/// Two uploads are in flight; only the one that stops sending anything times
/// out, the other keeps polling with `query-status` and finishes normally.
#[tokio::test]
async fn timeout_only_affects_the_idle_connection() {
    let server = spawn_server_with_timeout(1).await;

    let mut idle = RawClient::connect(server.addr, TOKEN).await;
    idle.send(&post_file("idle.raw")).await;
    idle.try_recv(Duration::from_secs(2)).await; // upload-approved

    let mut active = RawClient::connect(server.addr, TOKEN).await;
    active.send(&post_file("active.raw")).await;
    active.try_recv(Duration::from_secs(2)).await; // upload-approved

    // Keep `active` alive with periodic status queries while `idle` sends
    // nothing at all.
    let mut idle_timed_out = false;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        active.send(&vec![Bytes::from_static(b"query-status")]).await;
        if let Some(reply) = active.try_recv(Duration::from_millis(300)).await {
            assert_eq!(&reply[0][..], b"status-report");
        }
        if let Some(reply) = idle.try_recv(Duration::from_millis(50)).await {
            assert_eq!(&reply[0][..], b"error");
            let code = u32::from_be_bytes(reply[1][..].try_into().unwrap());
            assert_eq!(code, 408);
            idle_timed_out = true;
            break;
        }
    }

    assert!(idle_timed_out, "idle connection never received a timeout error");
}
