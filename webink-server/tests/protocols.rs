//! Integration tests — both front-ends running on localhost over a
//! fake renderer, exercising the end-to-end scenarios: hash stability,
//! tile slicing, byte identity across protocols, auth, and failure
//! surfacing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use webink_core::clients::ClientTracker;
use webink_core::error::WebInkError;
use webink_core::logbook::LogBook;
use webink_core::mode::ColorMode;
use webink_core::registry::{Device, DeviceRegistry, Viewport};
use webink_core::render::{Renderer, RenderFuture, RgbFrame};
use webink_core::schedule::RefreshSchedule;
use webink_core::snapshot::{SnapshotCache, SnapshotCacheConfig};

use webink_server::socket::SocketConfig;
use webink_server::{http, socket, AppState};

// ── Helpers ──────────────────────────────────────────────────────

/// Renderer producing a deterministic frame that changes per call.
struct FakeRenderer {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeRenderer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for FakeRenderer {
    fn render(&self, device: Arc<Device>) -> RenderFuture {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail.load(Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fail {
                return Err(WebInkError::RenderFailure("source URL returned 500".into()));
            }
            let (w, h) = (device.viewport.width, device.viewport.height);
            let mut data = Vec::with_capacity((w * h * 3) as usize);
            for y in 0..h {
                for x in 0..w {
                    let v = ((x * 7 + y * 13 + call as u32) % 256) as u8;
                    data.extend_from_slice(&[v, 255 - v, v ^ 0x33]);
                }
            }
            Ok(RgbFrame {
                width: w,
                height: h,
                data,
            })
        })
    }
}

fn device(id: &str, refresh: Duration) -> Device {
    Device {
        id: id.to_string(),
        api_key: "K".to_string(),
        source_url: "http://127.0.0.1:8080/".to_string(),
        viewport: Viewport {
            width: 800,
            height: 480,
        },
        color: ColorMode::Mono,
        refresh_interval: refresh,
        sleep_duration: Duration::from_secs(600),
        schedule: RefreshSchedule::default(),
    }
}

struct TestServer {
    http_addr: SocketAddr,
    socket_addr: SocketAddr,
    state: AppState,
    renderer: Arc<FakeRenderer>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spin up both front-ends on OS-assigned ports.
async fn start_server(devices: Vec<Device>) -> TestServer {
    let renderer = Arc::new(FakeRenderer::new());
    let registry = Arc::new(DeviceRegistry::new(devices).unwrap());
    let cache = Arc::new(SnapshotCache::new(
        renderer.clone(),
        &registry,
        SnapshotCacheConfig::default(),
    ));
    let state = AppState {
        registry,
        cache,
        logbook: Arc::new(LogBook::new(100)),
        clients: Arc::new(ClientTracker::new()),
    };
    let shutdown = CancellationToken::new();

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    tokio::spawn({
        let app = http::router(state.clone());
        let token = shutdown.clone();
        async move {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        }
    });

    let socket_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = socket_listener.local_addr().unwrap();
    tokio::spawn(socket::run(
        socket_listener,
        state.clone(),
        SocketConfig::default(),
        shutdown.clone(),
    ));

    TestServer {
        http_addr,
        socket_addr,
        state,
        renderer,
        shutdown,
    }
}

fn url(server: &TestServer, path_and_query: &str) -> String {
    format!("http://{}{}", server.http_addr, path_and_query)
}

/// Send one socket request line and read the reply to EOF.
async fn socket_request(addr: SocketAddr, line: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(line.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    reply
}

const PBM_FULL_HEADER: &[u8] = b"P4\n800 480\n";

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hash_is_stable_and_renders_once() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    let first: serde_json::Value = client
        .get(url(&server, "/get_hash?api_key=K&device=dev1&mode=800x480x1xB"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let h1 = first["hash"].as_str().unwrap().to_string();
    assert_eq!(h1.len(), 16);

    let second: serde_json::Value = client
        .get(url(&server, "/get_hash?api_key=K&device=dev1&mode=800x480x1xB"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["hash"].as_str().unwrap(), h1);
    assert_eq!(server.renderer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_slices_reassemble_with_one_render() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    // 16 non-overlapping slices of 800x30 tiling the full frame.
    let mut handles = Vec::new();
    for i in 0..16u32 {
        let client = client.clone();
        let u = url(
            &server,
            &format!(
                "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y={}&w=800&h=30&format=pbm",
                i * 30
            ),
        );
        handles.push(tokio::spawn(async move {
            let resp = client.get(u).send().await.unwrap();
            assert_eq!(resp.status(), 200);
            resp.bytes().await.unwrap().to_vec()
        }));
    }

    let slice_header = b"P4\n800 30\n".len();
    let mut stitched = Vec::new();
    for h in handles {
        let body = h.await.unwrap();
        assert_eq!(&body[..slice_header], b"P4\n800 30\n");
        stitched.extend_from_slice(&body[slice_header..]);
    }

    let whole = client
        .get(url(
            &server,
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=480&format=pbm",
        ))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(stitched, &whole[PBM_FULL_HEADER.len()..]);
    assert_eq!(server.renderer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn socket_bytes_equal_http_bytes() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    let via_http = client
        .get(url(
            &server,
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=8&format=pbm",
        ))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap()
        .to_vec();

    let via_socket = socket_request(
        server.socket_addr,
        "webInkV1 K dev1 800x480x1xB 0 0 800 8 pbm\n",
    )
    .await;

    assert!(!via_http.is_empty());
    assert_eq!(via_http, via_socket);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn post_log_roundtrip_and_auth() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(url(&server, "/post_log?api_key=K&device=dev1"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(server.state.logbook.len("dev1"), 1);

    // Config endpoint lists the device, without its key.
    let config: serde_json::Value = client
        .get(url(&server, "/api/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let devices = config["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["id"], "dev1");
    assert!(devices[0].get("api_key").is_none());

    // Wrong key: 401, log buffer unchanged.
    let resp = client
        .post(url(&server, "/post_log?api_key=WRONG&device=dev1"))
        .body("evil")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(server.state.logbook.len("dev1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn render_failure_is_503_until_source_recovers() {
    let server = start_server(vec![device("dev1", Duration::from_millis(100))]).await;
    let client = reqwest::Client::new();
    let image_url = url(
        &server,
        "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=8&format=pbm",
    );

    server.renderer.fail.store(true, Ordering::SeqCst);
    let resp = client.get(&image_url).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    assert!(resp.headers().contains_key("retry-after"));
    let resp = client.get(&image_url).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    // Source fixed; past the refresh interval a capture succeeds.
    server.renderer.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let resp = client.get(&image_url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..b"P4\n800 8\n".len()], b"P4\n800 8\n");

    let hash: serde_json::Value = client
        .get(url(&server, "/get_hash?api_key=K&device=dev1&mode=800x480x1xB"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hash["hash"].as_str().unwrap().len(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_frame_pbm_framing() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    let body = client
        .get(url(
            &server,
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=480&format=pbm",
        ))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(&body[..PBM_FULL_HEADER.len()], PBM_FULL_HEADER);
    assert_eq!(body.len() - PBM_FULL_HEADER.len(), 48_000);
}

// ── Validation & error surface ───────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_status_taxonomy() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    for (path, status) in [
        // Unknown device.
        ("/get_hash?api_key=K&device=ghost&mode=800x480x1xB", 404),
        // Bad key.
        ("/get_hash?api_key=NOPE&device=dev1&mode=800x480x1xB", 401),
        // Malformed mode string.
        ("/get_hash?api_key=K&device=dev1&mode=800x480", 400),
        // Mode that is not the device's configured mode.
        ("/get_hash?api_key=K&device=dev1&mode=800x480x8xG", 409),
        // Out-of-bounds rect.
        (
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=479&w=800&h=2&format=pbm",
            400,
        ),
        // Unknown format token.
        (
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=8&format=png",
            400,
        ),
        // Known token for the wrong mode.
        (
            "/get_image?api_key=K&device=dev1&mode=800x480x1xB&x=0&y=0&w=800&h=8&format=pgm",
            409,
        ),
    ] {
        let resp = client.get(url(&server, path)).send().await.unwrap();
        assert_eq!(resp.status(), status, "for {path}");
    }

    // Mode conflicts and validation failures never reached the
    // renderer; only the valid rect checks may have rendered.
    assert_eq!(server.renderer.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_sleep_reports_configured_duration() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    let resp: serde_json::Value = client
        .get(url(&server, "/get_sleep?api_key=K&device=dev1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["sleep"], 600);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn socket_failures_close_without_bytes() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;

    for line in [
        // Bad key.
        "webInkV1 WRONG dev1 800x480x1xB 0 0 800 8 pbm\n",
        // Unknown protocol version.
        "webInkV2 K dev1 800x480x1xB 0 0 800 8 pbm\n",
        // Wrong field count.
        "webInkV1 K dev1 800x480x1xB 0 0 800 8\n",
        // Unknown device.
        "webInkV1 K ghost 800x480x1xB 0 0 800 8 pbm\n",
        // Negative coordinate.
        "webInkV1 K dev1 800x480x1xB -1 0 800 8 pbm\n",
        // Out-of-bounds rect.
        "webInkV1 K dev1 800x480x1xB 0 479 800 2 pbm\n",
    ] {
        let reply = socket_request(server.socket_addr, line).await;
        assert!(reply.is_empty(), "got bytes for {line:?}");
    }

    // The connection still works for a valid request afterwards.
    let reply = socket_request(
        server.socket_addr,
        "webInkV1 K dev1 800x480x1xB 0 0 800 8 pbm\n",
    )
    .await;
    assert_eq!(&reply[..b"P4\n800 8\n".len()], b"P4\n800 8\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_activity_is_tracked() {
    let server = start_server(vec![device("dev1", Duration::from_secs(60))]).await;
    let client = reqwest::Client::new();

    client
        .get(url(&server, "/get_hash?api_key=K&device=dev1&mode=800x480x1xB"))
        .send()
        .await
        .unwrap();
    client
        .post(url(&server, "/post_metrics?api_key=K&device=dev1"))
        .body(r#"{"battery": 87, "dbm": -61}"#)
        .send()
        .await
        .unwrap();

    let clients: serde_json::Value = client
        .get(url(&server, "/api/clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients["dev1"]["requests"], 2);
    assert_eq!(clients["dev1"]["last_mode"], "800x480x1xB");
    assert_eq!(clients["dev1"]["last_metrics"]["battery"], 87);
}
