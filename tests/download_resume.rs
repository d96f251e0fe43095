// tests/download_resume.rs
// Resume-correctness round trip against a local ranged HTTP fixture.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use dailywell_ai::llm::local::acquisition::{AcquisitionSettings, ModelAcquisition};
use dailywell_ai::llm::local::DownloadState;
use dailywell_ai::test_helpers::FixedProbe;

/// Minimal HTTP file server honoring `Range: bytes=N-` requests, recording
/// every request it sees.
async fn spawn_fixture(payload: Vec<u8>, requests: Arc<Mutex<Vec<String>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let payload = payload.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut raw = String::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    raw.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if raw.contains("\r\n\r\n") {
                        break;
                    }
                }
                requests.lock().unwrap().push(raw.clone());

                let offset = parse_range_offset(&raw);
                let (status_line, body): (&str, &[u8]) = match offset {
                    Some(from) => {
                        let from = (from as usize).min(payload.len());
                        ("HTTP/1.1 206 Partial Content", &payload[from..])
                    }
                    None => ("HTTP/1.1 200 OK", &payload[..]),
                };
                let header = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/model")
}

fn parse_range_offset(request: &str) -> Option<u64> {
    request
        .to_lowercase()
        .lines()
        .find_map(|line| line.strip_prefix("range: bytes=").map(str::to_string))
        .and_then(|spec| spec.trim_end_matches('-').trim().parse().ok())
}

fn payload_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn settings(dir: &TempDir, url: &str, min_valid: u64, expected: u64) -> AcquisitionSettings {
    AcquisitionSettings {
        models_dir: dir.path().join("models"),
        filename: "coach.gguf".to_string(),
        expected_bytes: expected,
        min_valid_bytes: min_valid,
        safety_margin_bytes: 0,
        primary_url: url.to_string(),
        secondary_url: url.to_string(),
        bundled_dirs: Vec::new(),
        max_attempts: 2,
        stall_window: Duration::from_secs(30),
        progress_interval: Duration::from_millis(50),
        auto_start: true,
    }
}

async fn wait_for_terminal(acquisition: &ModelAcquisition, timeout: Duration) -> DownloadState {
    let mut rx = acquisition.subscribe();
    tokio::time::timeout(timeout, async {
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                DownloadState::Completed | DownloadState::Failed { .. } => return state,
                _ => {}
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("download did not reach a terminal state in time")
}

#[tokio::test]
async fn resumed_download_issues_range_request_and_completes() {
    let payload = payload_of(1_000);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_fixture(payload.clone(), requests.clone()).await;

    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, &url, 800, 1_000);
    std::fs::create_dir_all(&settings.models_dir).unwrap();
    // 200 bytes already on disk from an interrupted transfer.
    std::fs::write(settings.tmp_path(), &payload[..200]).unwrap();

    let acquisition =
        ModelAcquisition::new(settings.clone(), Arc::new(FixedProbe::plenty())).unwrap();
    let state = wait_for_completion(&acquisition).await;
    assert_eq!(state, DownloadState::Completed);

    // The final file is byte-identical to the fixture payload.
    let downloaded = std::fs::read(settings.model_path()).unwrap();
    assert_eq!(downloaded, payload);
    assert!(!settings.tmp_path().exists());

    // Exactly one request, resuming at the sidecar offset.
    let seen = requests.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(
        seen[0].to_lowercase().contains("range: bytes=200-"),
        "request was: {}",
        seen[0]
    );
}

#[tokio::test]
async fn fresh_download_completes_without_range_header() {
    let payload = payload_of(1_000);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_fixture(payload.clone(), requests.clone()).await;

    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, &url, 800, 1_000);

    let acquisition =
        ModelAcquisition::new(settings.clone(), Arc::new(FixedProbe::plenty())).unwrap();
    let state = wait_for_completion(&acquisition).await;
    assert_eq!(state, DownloadState::Completed);
    assert_eq!(std::fs::read(settings.model_path()).unwrap(), payload);

    let seen = requests.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].to_lowercase().contains("range:"));
}

#[tokio::test]
async fn model_ready_fires_exactly_once() {
    let payload = payload_of(1_000);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_fixture(payload.clone(), requests.clone()).await;

    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, &url, 800, 1_000);

    let acquisition =
        ModelAcquisition::new(settings, Arc::new(FixedProbe::plenty())).unwrap();
    let mut rx = acquisition.subscribe();
    acquisition.ensure_model().await.unwrap();

    let mut completed_transitions = 0;
    let state = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = rx.borrow_and_update().clone();
            if state == DownloadState::Completed {
                completed_transitions += 1;
                return state;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(state, DownloadState::Completed);

    // Re-running detection must not re-fire the ready notification.
    acquisition.ensure_model().await.unwrap();
    assert!(!rx.has_changed().unwrap());
    assert_eq!(completed_transitions, 1);
    acquisition.shutdown().await;
}

#[tokio::test]
async fn truncated_payload_is_discarded_as_corrupt() {
    // Server only has 500 bytes; the validity floor is 800.
    let payload = payload_of(500);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_fixture(payload, requests.clone()).await;

    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, &url, 800, 1_000);

    let acquisition =
        ModelAcquisition::new(settings.clone(), Arc::new(FixedProbe::plenty())).unwrap();
    acquisition.ensure_model().await.unwrap();
    let state = wait_for_terminal(&acquisition, Duration::from_secs(30)).await;

    assert!(matches!(state, DownloadState::Failed { .. }));
    // The partial file was discarded, never accepted.
    assert!(!settings.model_path().exists());
    assert!(!settings.tmp_path().exists());
    acquisition.shutdown().await;
}

async fn wait_for_completion(acquisition: &ModelAcquisition) -> DownloadState {
    // Kick off detection (no valid file -> download starts, auto_start on).
    acquisition.ensure_model().await.unwrap();
    let state = wait_for_terminal(acquisition, Duration::from_secs(10)).await;
    acquisition.shutdown().await;
    state
}
