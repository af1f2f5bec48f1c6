use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use cluster_client::{ClusterClient, UploaderOptions};
use cluster_protocol::{ClusterCommand, CommandEvent, CommandEventType, RequestType};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    lease: Arc<Mutex<Vec<(String, String, Option<String>)>>>,
    bodies: Arc<Mutex<Vec<(String, Value)>>>,
    uploads: Arc<Mutex<Vec<(String, String)>>>,
}

async fn lease(
    State(recorded): State<Recorded>,
    Path((cluster, run_target)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Json<Value> {
    recorded
        .lease
        .lock()
        .expect("lock")
        .push((cluster, run_target, query));
    Json(json!({"tasks": [{
        "request_id": "r1",
        "command_id": "c1",
        "task_id": "t1",
        "command_line": "run cts",
        "device_serials": ["ABC123"]
    }]}))
}

async fn lease_host(
    State(recorded): State<Recorded>,
    RawQuery(query): RawQuery,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorded
        .bodies
        .lock()
        .expect("lock")
        .push((query.unwrap_or_default(), body));
    Json(json!({}))
}

async fn command_events(State(recorded): State<Recorded>, Json(body): Json<Value>) -> StatusCode {
    recorded
        .bodies
        .lock()
        .expect("lock")
        .push(("command_events".to_string(), body));
    StatusCode::OK
}

async fn test_environment(Path(request_id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if request_id == "broken" {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(json!({
        "env_vars": [{"key": "TF_WORK", "value": "/tmp"}],
        "setup_scripts": ["setup.sh"],
        "output_file_patterns": ["logs/.*"],
        "output_file_upload_url": "http://storage/out"
    })))
}

async fn upload(
    State(recorded): State<Recorded>,
    Path(name): Path<String>,
    body: String,
) -> StatusCode {
    recorded.uploads.lock().expect("lock").push((name, body));
    StatusCode::CREATED
}

async fn serve(recorded: Recorded) -> String {
    let app = Router::new()
        .route("/api/tasks/lease/:cluster/:run_target", get(lease))
        .route("/api/tasks/leasehosttasks", post(lease_host))
        .route("/api/command_events", post(command_events))
        .route("/api/requests/:id/test_environment", get(test_environment))
        .route("/files/:name", put(upload))
        .with_state(recorded);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn lease_commands_over_http() {
    let recorded = Recorded::default();
    let base = serve(recorded.clone()).await;
    let client =
        ClusterClient::from_service_url(&format!("{base}/api"), UploaderOptions::default())
            .expect("client");

    let commands = client
        .lease_commands(
            "lab a",
            "taimen:userdebug",
            3,
            &["lab-b".to_string(), "lab-c".to_string()],
        )
        .await;

    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].target_device_serials(), ["ABC123"]);
    assert_eq!(commands[0].request_type(), RequestType::Unmanaged);
    let lease = recorded.lease.lock().expect("lock").clone();
    assert_eq!(lease[0].0, "lab a");
    assert_eq!(lease[0].1, "taimen:userdebug");
    assert_eq!(
        lease[0].2.as_deref(),
        Some("num_tasks=3&next_cluster_ids=lab-b&next_cluster_ids=lab-c")
    );
}

#[tokio::test]
async fn lease_host_commands_and_events_post_json() {
    let recorded = Recorded::default();
    let base = serve(recorded.clone()).await;
    let client =
        ClusterClient::from_service_url(&format!("{base}/api/"), UploaderOptions::default())
            .expect("client");

    let commands = client
        .lease_host_commands("lab-a", "host-1", Vec::new(), &[])
        .await;
    assert!(commands.is_empty());

    let command = ClusterCommand::new("r1", "c1", "t1", "run", RequestType::Unmanaged);
    let uploader = client.command_event_uploader();
    uploader
        .post_event(
            CommandEvent::builder(&command)
                .event_type(CommandEventType::InvocationStarted)
                .hostname("host-1")
                .build(),
        )
        .await;
    assert_eq!(uploader.pending().await, 0);

    let bodies = recorded.bodies.lock().expect("lock").clone();
    assert_eq!(bodies[0].0, "cluster=lab-a&hostname=host-1");
    assert_eq!(bodies[0].1, json!({"device_infos": []}));
    assert_eq!(bodies[1].0, "command_events");
    assert_eq!(bodies[1].1["command_events"][0]["type"], "InvocationStarted");
    assert_eq!(bodies[1].1["command_events"][0]["attempt_id"], command.attempt_id());
}

#[tokio::test]
async fn error_status_propagates() {
    let recorded = Recorded::default();
    let base = serve(recorded).await;
    let client =
        ClusterClient::from_service_url(&format!("{base}/api"), UploaderOptions::default())
            .expect("client");

    let environment = client.get_test_environment("r1").await.expect("environment");
    assert_eq!(environment.env_vars[0].key, "TF_WORK");
    assert_eq!(environment.setup_scripts, vec!["setup.sh".to_string()]);
    assert_eq!(
        environment.output_file_upload_url.as_deref(),
        Some("http://storage/out")
    );

    let err = client
        .get_test_environment("broken")
        .await
        .expect_err("500");
    assert!(format!("{err:#}").contains("500"));

    let misrouted =
        ClusterClient::from_service_url(&format!("{base}/missing"), UploaderOptions::default())
            .expect("client");
    let commands = misrouted.lease_commands("lab-a", "taimen", 1, &[]).await;
    assert!(commands.is_empty());
}

#[tokio::test]
async fn upload_file_puts_bytes() {
    let recorded = Recorded::default();
    let base = serve(recorded.clone()).await;
    let client = ClusterClient::from_service_url(&format!("{base}/api"), UploaderOptions::default())
        .expect("client");
    let path = std::env::temp_dir().join(format!("rest-api-upload-{}.txt", std::process::id()));
    std::fs::write(&path, "payload").expect("write");

    client
        .upload_file(&format!("{base}/files/result.txt"), &path)
        .await
        .expect("upload");

    let uploads = recorded.uploads.lock().expect("lock").clone();
    assert_eq!(uploads, vec![("result.txt".to_string(), "payload".to_string())]);
    let _ = std::fs::remove_file(&path);
}

/// Answers one GET announcing `length` bytes, writes `body` a byte every `gap`, then holds the
/// socket open.
async fn drip_server(length: usize, body: &'static [u8], gap: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|window| window == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {length}\r\n\r\n");
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        for byte in body {
            if socket.write_all(&[*byte]).await.is_err() || socket.flush().await.is_err() {
                return;
            }
            tokio::time::sleep(gap).await;
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });
    format!("http://{addr}")
}

fn download_dest(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("rest-api-download-{}", std::process::id()))
        .join(name)
}

#[tokio::test(start_paused = true)]
async fn slow_download_outlives_rpc_timeout() {
    let body = b"slow-build-data";
    let base = drip_server(body.len(), body, Duration::from_secs(5)).await;
    let client = ClusterClient::from_service_url(&format!("{base}/api"), UploaderOptions::default())
        .expect("client");
    let dest = download_dest("build.zip");
    let started = tokio::time::Instant::now();

    client
        .download_resource(&format!("{base}/build.zip"), &dest)
        .await
        .expect("download");

    assert!(started.elapsed() >= Duration::from_secs(70));
    assert_eq!(std::fs::read(&dest).expect("read"), body);
    let _ = std::fs::remove_file(&dest);
}

#[tokio::test(start_paused = true)]
async fn stalled_download_fails_and_leaves_no_file() {
    let base = drip_server(10, b"ab", Duration::from_secs(1)).await;
    let client = ClusterClient::from_service_url(&format!("{base}/api"), UploaderOptions::default())
        .expect("client");
    let dest = download_dest("stalled.zip");

    let err = client
        .download_resource(&format!("{base}/stalled.zip"), &dest)
        .await
        .expect_err("stalled");

    assert!(format!("{err:#}").contains("stalled"), "{err:#}");
    assert!(!dest.exists());
}
