//! Dispatcher tests against a scripted adb
//!
//! Nothing here needs a device, adb or tesseract. The fake bridge records
//! every invocation with timestamps so ordering and overlap can be checked.

#[path = "dispatcher/fake_adb.rs"]
mod fake_adb;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use droid_mcp::bridge::ScreenSize;
use droid_mcp::dispatcher::{Payload, RequestState};
use droid_mcp::processing::Region;
use droid_mcp::recognition::{Availability, OcrEngine, RecognitionResult, StageKind, StageOutcome, TextEntry};
use droid_mcp::registry::{BusyPolicy, ConnectionState};
use droid_mcp::{CommandResult, DroidMcpServer, ErrorKind, Method, RequestId};
use mcp_common::{EmbeddableError, EmbeddableMcp};

use fake_adb::{dispatcher, dispatcher_with_deadline, request, FakeAdb, FixedOcr};

fn kind(result: &CommandResult) -> Option<ErrorKind> {
    result.error().map(|e| e.kind)
}

// ============================================================================
// ORDERING AND ISOLATION
// ============================================================================

#[tokio::test]
async fn commands_for_one_device_run_in_acceptance_order() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let mut handles = Vec::new();
    for (i, ms) in [(1, 80), (2, 10), (3, 30)] {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.dispatch(request(i, "shell", json!({ "command": format!("slow {} cmd{}", ms, i) })))
                .await
        }));
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let shells: Vec<_> = adb
        .calls()
        .into_iter()
        .filter(|c| c.shell_command().is_some())
        .collect();
    let order: Vec<_> = shells.iter().map(|c| c.shell_command().unwrap()).collect();
    assert_eq!(order, ["slow 80 cmd1", "slow 10 cmd2", "slow 30 cmd3"]);
    for pair in shells.windows(2) {
        assert!(pair[1].started >= pair[0].finished, "commands overlapped");
    }
}

#[tokio::test]
async fn a_slow_device_does_not_hold_up_another() {
    let adb = FakeAdb::new(&["emulator-5554", "emulator-5556"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let slow = {
        let d = d.clone();
        tokio::spawn(async move {
            d.dispatch(request(
                1,
                "shell",
                json!({ "device": "emulator-5554", "command": "slow 300 a" }),
            ))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = d
        .dispatch(request(2, "shell", json!({ "device": "emulator-5556", "command": "slow 10 b" })))
        .await;
    assert!(fast.is_ok());
    assert!(!slow.is_finished(), "second device waited for the first");
    assert!(slow.await.unwrap().is_ok());
}

// ============================================================================
// DEVICE RESOLUTION
// ============================================================================

#[tokio::test]
async fn omitted_device_resolves_only_when_exactly_one_is_connected() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(1, "list_devices", json!({}))).await;

    let capture = d.dispatch(request(2, "capture_screen", json!({}))).await;
    assert!(capture.is_ok(), "{:?}", capture.error());
    assert_eq!(capture.device.as_deref(), Some("emulator-5554"));

    let adb = FakeAdb::new(&["emulator-5554", "emulator-5556"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(1, "list_devices", json!({}))).await;

    let capture = d.dispatch(request(2, "capture_screen", json!({}))).await;
    assert_eq!(capture.state, RequestState::Completed);
    assert_eq!(kind(&capture), Some(ErrorKind::AmbiguousDevice));
    assert!(adb.calls().iter().all(|c| c.argv[0] != "exec-out"));
}

#[tokio::test]
async fn unknown_device_completes_with_not_found() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let result = d
        .dispatch(request(5, "tap", json!({ "device": "emulator-5560", "x": 1, "y": 2 })))
        .await;
    assert_eq!(result.state, RequestState::Completed);
    assert_eq!(kind(&result), Some(ErrorKind::DeviceNotFound));
    assert!(adb.shell_commands().is_empty());
}

#[tokio::test]
async fn repeated_listing_is_stable() {
    let adb = FakeAdb::new(&["emulator-5556", "emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let first = d.dispatch(request(1, "list_devices", json!({}))).await;
    let second = d.dispatch(request(2, "list_devices", json!({}))).await;

    let first = serde_json::to_value(first.payload().unwrap()).unwrap();
    let second = serde_json::to_value(second.payload().unwrap()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["devices"][0]["device"], "emulator-5554");
    assert_eq!(first["devices"][0]["state"], "Connected");
    assert_eq!(first["devices"][0]["model"], "Pixel 7");
}

// ============================================================================
// REJECTIONS
// ============================================================================

#[tokio::test]
async fn unknown_methods_and_bad_params_never_reach_the_device() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let unknown = d.dispatch(request(1, "reboot", json!({}))).await;
    assert_eq!(unknown.state, RequestState::Rejected);
    assert_eq!(kind(&unknown), Some(ErrorKind::UnknownMethod));
    assert_eq!(unknown.id, RequestId::Number(1));

    let missing = d.dispatch(request(2, "tap", json!({ "x": 10 }))).await;
    assert_eq!(missing.state, RequestState::Rejected);
    assert_eq!(kind(&missing), Some(ErrorKind::InvalidParameters));

    let malformed = d
        .dispatch(request(3, "match_image", json!({ "template": "%%%", "threshold": 0.5 })))
        .await;
    assert_eq!(kind(&malformed), Some(ErrorKind::InvalidParameters));

    let bad_stage = d
        .dispatch(request(4, "capture_screen", json!({ "stages": ["imageMatch"] })))
        .await;
    assert_eq!(kind(&bad_stage), Some(ErrorKind::InvalidParameters));

    assert!(adb.calls().is_empty());
}

// ============================================================================
// RECOGNITION
// ============================================================================

#[tokio::test]
async fn capture_with_missing_ocr_still_returns_raw_frame() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let result = d
        .dispatch(request(
            7,
            "capture_screen",
            json!({ "device": "emulator-5554", "stages": ["run_ocr"] }),
        ))
        .await;

    assert_eq!(result.id, RequestId::Number(7));
    assert_eq!(result.state, RequestState::Completed);
    let Some(Payload::Capture(capture)) = result.payload() else {
        panic!("expected a capture, got {:?}", result.outcome);
    };
    assert_eq!(capture.data, adb.screen());
    assert_eq!(capture.mime_type, "image/png");
    assert_eq!((capture.width, capture.height), (48, 32));
    assert_eq!(capture.stages.len(), 1);
    assert_eq!(capture.stages[0].stage, StageKind::Ocr);
    assert!(matches!(
        &capture.stages[0].outcome,
        StageOutcome::Error(e) if e.kind == ErrorKind::RecognitionUnavailable
    ));
}

#[tokio::test]
async fn ocr_on_a_blank_screen_is_an_empty_result() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let ocr: Arc<dyn OcrEngine> = Arc::new(FixedOcr(Vec::new()));
    let d = dispatcher(&adb, BusyPolicy::Queue, Some(ocr));

    let result = d.dispatch(request(1, "run_ocr", json!({}))).await;
    match result.payload() {
        Some(Payload::Recognition(RecognitionResult::Text(words))) => assert!(words.is_empty()),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn run_ocr_without_engine_fails_before_touching_the_device() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let result = d.dispatch(request(1, "run_ocr", json!({}))).await;
    assert_eq!(kind(&result), Some(ErrorKind::RecognitionUnavailable));
    assert!(adb.calls().is_empty());
}

#[tokio::test]
async fn capture_stages_report_in_request_order() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let words = vec![TextEntry {
        text: "Settings".into(),
        bounds: Region::new(2, 2, 20, 8),
        confidence: 0.93,
    }];
    let ocr: Arc<dyn OcrEngine> = Arc::new(FixedOcr(words));
    let d = dispatcher(&adb, BusyPolicy::Queue, Some(ocr));

    let template = {
        use base64::Engine;
        let frame = image::load_from_memory(adb.screen()).unwrap();
        let mut buf = Vec::new();
        frame
            .crop_imm(10, 8, 12, 12)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf)
    };

    let result = d
        .dispatch(request(
            1,
            "capture_screen",
            json!({
                "stages": ["imageMatch", "ocr"],
                "match": { "template": template, "threshold": 0.95 },
                "format": "jpeg",
                "max_width": 24
            }),
        ))
        .await;

    let Some(Payload::Capture(capture)) = result.payload() else {
        panic!("expected a capture, got {:?}", result.outcome);
    };
    assert_eq!(capture.mime_type, "image/jpeg");
    assert_eq!((capture.width, capture.height), (24, 16));

    let stages: Vec<_> = capture.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, [StageKind::ImageMatch, StageKind::Ocr]);
    match &capture.stages[0].outcome {
        StageOutcome::Result(RecognitionResult::Matches(hits)) => {
            assert_eq!(hits[0].region, Region::new(10, 8, 12, 12));
        }
        other => panic!("unexpected match outcome {:?}", other),
    }
    match &capture.stages[1].outcome {
        StageOutcome::Result(RecognitionResult::Text(words)) => assert_eq!(words[0].text, "Settings"),
        other => panic!("unexpected ocr outcome {:?}", other),
    }
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn exhausted_retries_disconnect_the_session() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(1, "list_devices", json!({}))).await;

    adb.break_transport();
    let result = d.dispatch(request(2, "tap", json!({ "x": 5, "y": 5 }))).await;

    assert_eq!(kind(&result), Some(ErrorKind::DeviceUnreachable));
    assert_eq!(adb.shell_commands().len(), 3);
    let snapshot = d.registry().snapshot("emulator-5554").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn device_command_failure_is_an_execution_error() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let result = d.dispatch(request(1, "shell", json!({ "command": "fail 2" }))).await;
    assert_eq!(kind(&result), Some(ErrorKind::BridgeExecutionError));
    assert_eq!(adb.shell_commands(), ["fail 2"]);

    let snapshot = d.registry().snapshot("emulator-5554").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
}

#[tokio::test]
async fn launch_reports_missing_packages() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let ok = d
        .dispatch(request(1, "launch_app", json!({ "package": "com.android.settings" })))
        .await;
    assert!(ok.is_ok());

    let missing = d
        .dispatch(request(2, "launch_app", json!({ "package": "com.missing.app" })))
        .await;
    assert_eq!(kind(&missing), Some(ErrorKind::BridgeExecutionError));
}

#[tokio::test]
async fn a_device_that_stops_answering_is_disconnected() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher_with_deadline(&adb, BusyPolicy::Queue, None, Duration::from_millis(50));
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let mut kinds = Vec::new();
    for id in 1..=3 {
        let result = d
            .dispatch(request(id, "shell", json!({ "command": format!("slow 1000 hung{}", id) })))
            .await;
        kinds.push(kind(&result));
    }

    assert_eq!(
        kinds,
        [
            Some(ErrorKind::BridgeTimeout),
            Some(ErrorKind::BridgeTimeout),
            Some(ErrorKind::DeviceUnreachable)
        ]
    );
    let snapshot = d.registry().snapshot("emulator-5554").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn launch_quotes_inner_class_activities() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let result = d
        .dispatch(request(
            1,
            "launch_app",
            json!({ "package": "com.example.app", "activity": ".Main$Inner" }),
        ))
        .await;
    assert!(result.is_ok(), "{:?}", result.error());
    assert_eq!(adb.shell_commands(), ["am start -n 'com.example.app/.Main$Inner'"]);
}

#[tokio::test]
async fn command_queued_behind_disconnect_never_runs() {
    let adb = FakeAdb::new(&["10.0.0.5:5555"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let spawn = |id: i64, method: &'static str, params: serde_json::Value| {
        let d = d.clone();
        tokio::spawn(async move { d.dispatch(request(id, method, params)).await })
    };
    let busy = spawn(1, "shell", json!({ "command": "slow 150 hold" }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let disconnect = spawn(2, "disconnect_device", json!({ "device": "10.0.0.5:5555" }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let tap = spawn(3, "tap", json!({ "device": "10.0.0.5:5555", "x": 1, "y": 1 }));

    assert!(busy.await.unwrap().is_ok());
    assert!(disconnect.await.unwrap().is_ok());
    let tap = tap.await.unwrap();
    assert_eq!(kind(&tap), Some(ErrorKind::DeviceNotFound));
    assert_eq!(adb.shell_commands(), ["slow 150 hold"]);
}

#[tokio::test]
async fn reject_policy_fails_fast_when_busy() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Reject, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let slow = {
        let d = d.clone();
        tokio::spawn(async move { d.dispatch(request(1, "shell", json!({ "command": "slow 200 a" }))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let busy = d.dispatch(request(2, "tap", json!({ "x": 1, "y": 1 }))).await;
    assert_eq!(kind(&busy), Some(ErrorKind::DeviceBusy));
    assert!(slow.await.unwrap().is_ok());
    assert_eq!(adb.shell_commands(), ["slow 200 a"]);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn cancelled_requests_never_reach_the_device() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = d
        .dispatch_with_cancel(request(1, "tap", json!({ "x": 1, "y": 1 })), cancel)
        .await;
    assert_eq!(kind(&result), Some(ErrorKind::Cancelled));

    // Queued behind another command, then cancelled
    let busy = {
        let d = d.clone();
        tokio::spawn(async move { d.dispatch(request(2, "shell", json!({ "command": "slow 150 a" }))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    let queued = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            d.dispatch_with_cancel(request(3, "shell", json!({ "command": "echo never" })), cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    assert_eq!(kind(&queued.await.unwrap()), Some(ErrorKind::Cancelled));
    assert!(busy.await.unwrap().is_ok());
    assert_eq!(adb.shell_commands(), ["slow 150 a"]);
}

#[tokio::test]
async fn cancelling_a_running_command_is_uncertain() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    d.dispatch(request(0, "list_devices", json!({}))).await;

    let cancel = CancellationToken::new();
    let running = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            d.dispatch_with_cancel(request(1, "shell", json!({ "command": "slow 100 a" })), cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let result = running.await.unwrap();
    assert_eq!(result.state, RequestState::Completed);
    assert_eq!(kind(&result), Some(ErrorKind::Uncertain));
    // The bridge call was allowed to finish
    assert_eq!(adb.shell_commands(), ["slow 100 a"]);
    let snapshot = d.registry().snapshot("emulator-5554").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
}

#[tokio::test]
async fn cancelled_call_that_never_answers_is_abandoned_after_one_deadline() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher_with_deadline(&adb, BusyPolicy::Queue, None, Duration::from_millis(200));
    d.dispatch(request(0, "list_devices", json!({}))).await;
    adb.hang_captures();

    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();
    let running = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            d.dispatch_with_cancel(request(1, "capture_screen", json!({})), cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = running.await.unwrap();
    assert_eq!(kind(&result), Some(ErrorKind::Uncertain));
    assert!(result.error().unwrap().message.contains("abandoned"));
    // Retrying the capture to exhaustion would take three deadlines
    assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
}

// ============================================================================
// FILE TRANSFER
// ============================================================================

fn transfer_report(result: &CommandResult) -> &droid_mcp::bridge::TransferReport {
    match result.payload() {
        Some(Payload::Transfer(report)) => report,
        other => panic!("expected a transfer report, got {:?} / {:?}", other, result.error()),
    }
}

#[tokio::test]
async fn push_appears_only_once_complete() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("hello.txt");
    std::fs::write(&local, b"hello droid").unwrap();

    let result = d
        .dispatch(request(
            1,
            "push_file",
            json!({ "local_path": local, "remote_path": "/sdcard/Download/greeting.txt" }),
        ))
        .await;

    let report = transfer_report(&result);
    assert_eq!(report.destination, "/sdcard/Download/greeting.txt");
    assert_eq!(report.bytes, 11);
    assert_eq!(adb.remote_paths(), ["/sdcard/Download/greeting.txt"]);
    assert_eq!(adb.remote_file("/sdcard/Download/greeting.txt").unwrap(), b"hello droid");
}

#[tokio::test]
async fn push_into_a_directory_keeps_the_file_name() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("hello.txt");
    std::fs::write(&local, b"hello droid").unwrap();

    for (id, remote) in [(1, "/sdcard/Download/"), (2, "/sdcard/Download")] {
        let result = d
            .dispatch(request(id, "push_file", json!({ "local_path": local, "remote_path": remote })))
            .await;
        assert_eq!(transfer_report(&result).destination, "/sdcard/Download/hello.txt");
    }
    assert_eq!(adb.remote_paths(), ["/sdcard/Download/hello.txt"]);
    assert!(adb
        .shell_commands()
        .iter()
        .all(|c| !c.contains("/sdcard/Download/.part") && !c.contains("/sdcard/Download.part")));
}

#[tokio::test]
async fn short_push_leaves_nothing_on_the_device() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("app.apk");
    std::fs::write(&local, vec![7u8; 4096]).unwrap();
    adb.truncate_pushes();

    let result = d
        .dispatch(request(
            1,
            "push_file",
            json!({ "local_path": local, "remote_path": "/sdcard/Download/app.apk" }),
        ))
        .await;

    assert_eq!(kind(&result), Some(ErrorKind::TransferError));
    assert!(result.error().unwrap().message.contains("size mismatch"));
    assert!(adb.remote_paths().is_empty(), "{:?}", adb.remote_paths());
}

#[tokio::test]
async fn pull_creates_parent_directories_and_commits_the_file() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);
    adb.put_remote("/sdcard/DCIM/shot.png", b"not really a png");
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("pulled/shot.png");

    let result = d
        .dispatch(request(
            1,
            "pull_file",
            json!({ "remote_path": "/sdcard/DCIM/shot.png", "local_path": local }),
        ))
        .await;

    assert_eq!(transfer_report(&result).bytes, 16);
    assert_eq!(std::fs::read(&local).unwrap(), b"not really a png");
    assert!(!dir.path().join("pulled/shot.png.part").exists());
}

#[tokio::test]
async fn failed_or_short_pull_leaves_no_local_file() {
    let dir = tempfile::tempdir().unwrap();

    for (id, aborted) in [(1, true), (2, false)] {
        let adb = FakeAdb::new(&["emulator-5554"]);
        let d = dispatcher(&adb, BusyPolicy::Queue, None);
        adb.put_remote("/sdcard/DCIM/shot.png", &[9u8; 1024]);
        if aborted {
            adb.fail_pulls();
        } else {
            adb.truncate_pulls();
        }

        let local = dir.path().join(format!("shot{}.png", id));
        let result = d
            .dispatch(request(
                id,
                "pull_file",
                json!({ "remote_path": "/sdcard/DCIM/shot.png", "local_path": local }),
            ))
            .await;

        assert_eq!(kind(&result), Some(ErrorKind::TransferError));
        assert!(!local.exists());
        assert!(!dir.path().join(format!("shot{}.png.part", id)).exists());
    }
}

// ============================================================================
// DEVICE QUERIES
// ============================================================================

#[tokio::test]
async fn device_queries_report_what_the_device_says() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let size = d.dispatch(request(1, "get_screen_size", json!({}))).await;
    assert!(matches!(
        size.payload(),
        Some(Payload::Screen(ScreenSize { width: 1080, height: 2400 }))
    ));

    let info = d.dispatch(request(2, "get_device_info", json!({}))).await;
    let info = serde_json::to_value(info.payload().unwrap()).unwrap();
    assert_eq!(info["model"], "Pixel 7");
    assert_eq!(info["manufacturer"], "Google");
    assert_eq!(info["android_version"], "14");
    assert_eq!(info["screen"]["height"], 2400);

    let current = d.dispatch(request(3, "get_current_app", json!({}))).await;
    let current = serde_json::to_value(current.payload().unwrap()).unwrap();
    assert_eq!(current["package"], "com.example.app");
    assert_eq!(current["activity"], ".MainActivity");
}

#[tokio::test]
async fn package_queries_filter_on_the_host() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let apps = d.dispatch(request(1, "list_apps", json!({}))).await;
    let apps = serde_json::to_value(apps.payload().unwrap()).unwrap();
    assert_eq!(
        apps["apps"],
        json!([{ "package": "com.example.app" }, { "package": "com.example.app.debug" }])
    );

    let system = d.dispatch(request(2, "list_apps", json!({ "filter": "system" }))).await;
    let system = serde_json::to_value(system.payload().unwrap()).unwrap();
    assert_eq!(system["apps"], json!([{ "package": "com.android.settings" }]));

    let installed = d
        .dispatch(request(3, "check_app_installed", json!({ "package": "com.example.app" })))
        .await;
    assert_eq!(serde_json::to_value(installed.payload().unwrap()).unwrap()["installed"], true);

    // A prefix of an installed package is not installed
    let prefix = d
        .dispatch(request(4, "check_app_installed", json!({ "package": "com.example" })))
        .await;
    assert_eq!(serde_json::to_value(prefix.payload().unwrap()).unwrap()["installed"], false);

    assert_eq!(
        adb.shell_commands(),
        [
            "pm list packages -3",
            "pm list packages -s",
            "pm list packages 'com.example.app'",
            "pm list packages 'com.example'",
        ]
    );
}

#[tokio::test]
async fn logs_and_long_press_use_the_expected_commands() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let logs = d
        .dispatch(request(
            1,
            "capture_logs",
            json!({ "buffer": "crash", "lines": 50, "filter": "com.example.app" }),
        ))
        .await;
    let logs = serde_json::to_value(logs.payload().unwrap()).unwrap();
    assert_eq!(logs["buffer"], "crash");
    assert_eq!(logs["lines"].as_array().unwrap().len(), 1);
    assert!(logs["lines"][0].as_str().unwrap().contains("Start proc com.example.app"));

    let pressed = d.dispatch(request(2, "long_press", json!({ "x": 3, "y": 4 }))).await;
    assert!(pressed.is_ok());

    assert_eq!(
        adb.shell_commands(),
        ["logcat -b crash -d -t 50", "input swipe 3 4 3 4 1000"]
    );
}

// ============================================================================
// MCP SURFACE
// ============================================================================

#[tokio::test]
async fn embedded_server_exposes_every_method() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let server = DroidMcpServer::new(dispatcher(&adb, BusyPolicy::Queue, None));

    let mut tools: Vec<String> = server.list_tools().iter().map(|t| t.name.to_string()).collect();
    tools.sort();
    let mut methods: Vec<&str> = Method::ALL.iter().map(|m| m.as_str()).collect();
    methods.sort();
    assert_eq!(tools, methods);

    let tapped = server.call_tool("tap", json!({ "x": 3, "y": 4 })).await;
    assert!(tapped.is_ok());
    assert_eq!(adb.shell_commands(), ["input tap 3 4"]);

    let typed = server
        .call_tool("input_text", json!({ "text": "hello world" }))
        .await;
    assert!(typed.is_ok());
    assert_eq!(adb.shell_commands()[1], "input text 'hello%sworld'");

    let err = server.call_tool("reboot", json!({})).await.unwrap_err();
    assert!(matches!(err, EmbeddableError::ToolNotFound(_)));

    let err = server
        .call_tool("tap", json!({ "device": "emulator-5560", "x": 1, "y": 1 }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("DeviceNotFound"));
}

#[tokio::test]
async fn server_reports_the_stack_it_was_built_with() {
    let adb = FakeAdb::new(&["emulator-5554"]);
    let server = DroidMcpServer::new(dispatcher_with_deadline(
        &adb,
        BusyPolicy::Queue,
        None,
        Duration::from_millis(750),
    ));
    let d = server.dispatcher();

    let bridge = d.registry().bridge();
    assert_eq!(bridge.policy().timeout, Duration::from_millis(750));
    assert_eq!(bridge.policy().max_attempts, 3);
    assert_eq!(bridge.version().await.unwrap(), "Android Debug Bridge version 1.0.41");

    assert!(matches!(
        d.pipeline().availability(StageKind::Ocr).await,
        Availability::Unavailable(_)
    ));
    assert_eq!(d.pipeline().availability(StageKind::ImageMatch).await, Availability::Available);
}

#[tokio::test]
async fn network_devices_connect_and_disconnect() {
    let adb = FakeAdb::new(&[]);
    let d = dispatcher(&adb, BusyPolicy::Queue, None);

    let connected = d
        .dispatch(request(1, "connect_device", json!({ "address": "192.168.1.20:5555" })))
        .await;
    match connected.payload() {
        Some(Payload::Device(snapshot)) => {
            assert_eq!(snapshot.device, "192.168.1.20:5555");
            assert_eq!(snapshot.state, ConnectionState::Connected);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let tapped = d.dispatch(request(2, "tap", json!({ "x": 1, "y": 1 }))).await;
    assert_eq!(tapped.device.as_deref(), Some("192.168.1.20:5555"));

    let gone = d
        .dispatch(request(3, "disconnect_device", json!({ "device": "192.168.1.20:5555" })))
        .await;
    assert!(gone.is_ok());
    assert!(d.registry().snapshot("192.168.1.20:5555").await.is_none());
    assert!(adb.calls().iter().any(|c| c.argv == ["disconnect", "192.168.1.20:5555"]));
}
