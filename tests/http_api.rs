use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use envwatch::config::{Config, SourceConfig};
use envwatch::dashboard::{CollectionControl, Dashboard};
use envwatch::export::health::HealthMetrics;
use envwatch::source::{Client, SensorSource};
use envwatch::window::MetricWindows;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    addr
}

fn sensor_router() -> Router {
    Router::new()
        .route(
            "/sensor/getAllSensor",
            get(|| async {
                Json(json!({
                    "code": 200,
                    "data": {"sensor": {"Noise": "35", "Temperature": "-6", "Station": "roof"}}
                }))
            }),
        )
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "sensor offline") }),
        )
}

/// Control that only tracks the requested state.
struct FixedControl {
    collecting: AtomicBool,
}

impl CollectionControl for FixedControl {
    fn start_collection(&self) -> bool {
        !self.collecting.swap(true, Ordering::SeqCst)
    }

    fn stop_collection(&self) -> bool {
        self.collecting.swap(false, Ordering::SeqCst)
    }

    fn set_poll_interval(&self, _interval: Duration) -> anyhow::Result<()> {
        anyhow::bail!("interval is fixed")
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }
}

fn source_config(url: String) -> SourceConfig {
    SourceConfig {
        endpoint: url,
        timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_client_fetch_unwraps_envelope() {
    let addr = serve(sensor_router()).await;
    let client = Client::new(&source_config(format!("http://{addr}/sensor/getAllSensor")))
        .expect("client");

    let record = client.fetch().await.expect("fetch");
    let names: Vec<&str> = record.field_names().collect();
    assert_eq!(names, vec!["Noise", "Temperature", "Station", "timestamp"]);
    assert_eq!(record.metric("Temperature").expect("numeric"), -6.0);
    assert_eq!(record.text("Station").as_deref(), Some("roof"));
}

#[tokio::test]
async fn test_client_fetch_reports_status_errors() {
    let addr = serve(sensor_router()).await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    let client = Client::new(&source_config(format!("http://{addr}/broken")))
        .expect("client")
        .with_metrics(Box::new(move |status: &str, _: Duration| {
            seen.lock().push(status.to_string())
        }));

    let err = client.fetch().await.expect_err("500 should fail");
    assert!(err.to_string().contains("500"));
    assert_eq!(*calls.lock(), vec!["error".to_string()]);
}

#[tokio::test]
async fn test_window_api() {
    let mut windows = MetricWindows::new(&["Noise", "Temperature"], 3).expect("windows");
    let record = [("Noise", json!("35")), ("Temperature", json!("-6"))]
        .into_iter()
        .collect();
    windows.ingest(&record).expect("ingest");
    let windows = Arc::new(Mutex::new(windows));

    let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
    let control = Arc::new(FixedControl {
        collecting: AtomicBool::new(false),
    });
    let addr = health
        .start(Arc::clone(&windows), control)
        .await
        .expect("start");
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let body: Value = http
        .get(format!("{base}/windows"))
        .send()
        .await
        .expect("get windows")
        .json()
        .await
        .expect("json");
    assert_eq!(body["selected"], "Noise");
    assert_eq!(body["windows"][1]["metric"], "Temperature");
    assert_eq!(body["windows"][1]["samples"], json!([-6.0]));

    let resp = http
        .put(format!("{base}/selected/Temperature"))
        .send()
        .await
        .expect("select");
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(windows.lock().selected(), "Temperature");

    let resp = http
        .put(format!("{base}/selected/Rainfall"))
        .send()
        .await
        .expect("select unknown");
    assert_eq!(resp.status().as_u16(), 404);

    let resp = http
        .get(format!("{base}/windows/Rainfall"))
        .send()
        .await
        .expect("unknown window");
    assert_eq!(resp.status().as_u16(), 404);

    let text = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("text");
    assert!(text.contains("envwatch_collecting"));

    let body: Value = http
        .post(format!("{base}/collection/start"))
        .send()
        .await
        .expect("start collection")
        .json()
        .await
        .expect("json");
    assert_eq!(body, json!({"collecting": true, "poll_interval": "1s"}));

    let resp = http
        .put(format!("{base}/collection/interval/2s"))
        .send()
        .await
        .expect("set interval");
    assert_eq!(resp.status().as_u16(), 400);

    health.stop().await.expect("stop");
}

#[tokio::test]
async fn test_dashboard_end_to_end() {
    let addr = serve(sensor_router()).await;
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut cfg = Config {
        source: SourceConfig {
            poll_interval: Duration::from_millis(20),
            ..source_config(format!("http://{addr}/sensor/getAllSensor"))
        },
        ..Default::default()
    };
    cfg.window.metrics = vec!["Noise".into(), "Temperature".into()];
    cfg.csv.dir = tmp.path().to_path_buf();
    cfg.csv.batch_size = 3;
    cfg.render.enabled = false;
    cfg.health.enabled = false;
    cfg.validate().expect("valid config");

    let mut dashboard = Dashboard::new(cfg).expect("dashboard");
    dashboard.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;
    dashboard.stop().await.expect("stop");

    let frame = dashboard.frame();
    assert!(!frame.collecting);
    assert_eq!(frame.metric, "Noise");
    assert!(!frame.samples.is_empty());
    assert!(frame.samples.iter().all(|v| *v == 35.0));

    let files: Vec<_> = std::fs::read_dir(tmp.path())
        .expect("read dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().and_then(|n| n.to_str()).expect("name");
    assert!(name.starts_with("env_data_") && name.ends_with(".csv"));

    let contents = std::fs::read_to_string(&files[0]).expect("read csv");
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("Noise,Temperature,Station,timestamp"));
    let row = lines.next().expect("at least one row");
    assert!(row.starts_with("35.0,-6.0,roof,"));
    assert_eq!(dashboard.pending_records(), 0);
}

#[tokio::test]
async fn test_collection_controls() {
    let addr = serve(sensor_router()).await;
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut cfg = Config {
        source: SourceConfig {
            poll_interval: Duration::from_millis(20),
            ..source_config(format!("http://{addr}/sensor/getAllSensor"))
        },
        ..Default::default()
    };
    cfg.window.metrics = vec!["Noise".into(), "Temperature".into()];
    cfg.csv.dir = tmp.path().to_path_buf();
    cfg.render.enabled = false;
    cfg.health.addr = "127.0.0.1:0".to_string();

    let mut dashboard = Dashboard::new(cfg).expect("dashboard");
    dashboard.start().await.expect("start");
    let base = format!("http://{}", dashboard.health_addr().expect("health server"));
    let http = reqwest::Client::new();

    let body: Value = http
        .get(format!("{base}/collection"))
        .send()
        .await
        .expect("state")
        .json()
        .await
        .expect("json");
    assert_eq!(body, json!({"collecting": true, "poll_interval": "20ms"}));

    let body: Value = http
        .post(format!("{base}/collection/stop"))
        .send()
        .await
        .expect("stop collection")
        .json()
        .await
        .expect("json");
    assert_eq!(body["collecting"], false);
    assert!(!dashboard.is_collecting());

    let body: Value = http
        .put(format!("{base}/collection/interval/250ms"))
        .send()
        .await
        .expect("set interval")
        .json()
        .await
        .expect("json");
    assert_eq!(body, json!({"collecting": false, "poll_interval": "250ms"}));
    assert_eq!(dashboard.poll_interval(), Duration::from_millis(250));

    for bad in ["soon", "0s"] {
        let resp = http
            .put(format!("{base}/collection/interval/{bad}"))
            .send()
            .await
            .expect("bad interval");
        assert_eq!(resp.status().as_u16(), 400);
    }
    assert_eq!(dashboard.poll_interval(), Duration::from_millis(250));

    let body: Value = http
        .post(format!("{base}/collection/start"))
        .send()
        .await
        .expect("start collection")
        .json()
        .await
        .expect("json");
    assert_eq!(body["collecting"], true);
    assert!(dashboard.is_collecting());

    tokio::time::sleep(Duration::from_millis(100)).await;
    dashboard.stop().await.expect("stop");
    assert!(dashboard.latest().is_some());
}
