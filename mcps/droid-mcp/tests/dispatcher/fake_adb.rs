//! Scripted stand-in for the adb executable
//!
//! Understands the argv shapes the bridge adapter produces and records every
//! call with its start and finish instants. Shell commands of the form
//! `slow <ms> <tag>` sleep before answering, `fail <code>` exits non-zero.
//! Pushed files land in an in-memory device filesystem.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;

use droid_mcp::bridge::{BridgeAdapter, BridgeOutput, BridgeRunner, RetryPolicy};
use droid_mcp::recognition::{
    Availability, OcrEngine, OcrError, RecognitionPipeline, TemplateMatcher, TextEntry,
};
use droid_mcp::registry::{BusyPolicy, DeviceRegistry};
use droid_mcp::{CommandRequest, Dispatcher};

#[derive(Debug, Clone)]
pub struct Call {
    pub serial: Option<String>,
    pub argv: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

impl Call {
    /// The device shell command line, for `shell` calls
    pub fn shell_command(&self) -> Option<String> {
        match self.argv.first().map(String::as_str) {
            Some("shell") => Some(self.argv[1..].join(" ")),
            _ => None,
        }
    }
}

pub struct FakeAdb {
    devices: Mutex<Vec<String>>,
    screen: Vec<u8>,
    calls: Mutex<Vec<Call>>,
    broken: AtomicBool,
    hung_captures: AtomicBool,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: BTreeSet<String>,
    short_pushes: AtomicBool,
    short_pulls: AtomicBool,
    failing_pulls: AtomicBool,
}

impl FakeAdb {
    pub fn new(devices: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices.iter().map(|d| d.to_string()).collect()),
            screen: screen_png(),
            calls: Mutex::new(Vec::new()),
            broken: AtomicBool::new(false),
            hung_captures: AtomicBool::new(false),
            files: Mutex::new(BTreeMap::new()),
            dirs: ["/sdcard", "/sdcard/Download"].iter().map(|d| d.to_string()).collect(),
            short_pushes: AtomicBool::new(false),
            short_pulls: AtomicBool::new(false),
            failing_pulls: AtomicBool::new(false),
        })
    }

    /// Screen captures never answer
    pub fn hang_captures(&self) {
        self.hung_captures.store(true, Ordering::SeqCst);
    }

    /// Pushes store only half the bytes
    pub fn truncate_pushes(&self) {
        self.short_pushes.store(true, Ordering::SeqCst);
    }

    /// Pulls write only half the bytes
    pub fn truncate_pulls(&self) {
        self.short_pulls.store(true, Ordering::SeqCst);
    }

    /// Pulls write half the bytes, then fail
    pub fn fail_pulls(&self) {
        self.failing_pulls.store(true, Ordering::SeqCst);
    }

    pub fn put_remote(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn screen(&self) -> &[u8] {
        &self.screen
    }

    /// Every later call fails to spawn
    pub fn break_transport(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.calls().iter().filter_map(Call::shell_command).collect()
    }

    fn device_list(&self) -> String {
        let mut out = String::from("List of devices attached\n");
        for serial in self.devices.lock().unwrap().iter() {
            out.push_str(&format!(
                "{}\tdevice product:sdk_gphone64 model:Pixel_7 transport_id:1\n",
                serial
            ));
        }
        out
    }

    async fn answer(&self, argv: &[String]) -> BridgeOutput {
        let words: Vec<&str> = argv.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["devices", "-l"] => text(self.device_list()),
            ["version"] => text("Android Debug Bridge version 1.0.41\n"),
            ["connect", address] => {
                self.devices.lock().unwrap().push(address.to_string());
                text(format!("connected to {}\n", address))
            }
            ["disconnect", address] => {
                self.devices.lock().unwrap().retain(|d| d.as_str() != *address);
                text(format!("disconnected {}\n", address))
            }
            ["exec-out", "screencap", "-p"] => {
                if self.hung_captures.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                BridgeOutput {
                    stdout: self.screen.clone(),
                    ..Default::default()
                }
            }
            ["push", local, remote] => self.push(local, remote),
            ["pull", remote, local] => self.pull(remote, local),
            ["shell", rest @ ..] => self.shell(&rest.join(" ")).await,
            _ => BridgeOutput {
                stderr: format!("adb: unknown command {}", argv.join(" ")),
                code: 1,
                ..Default::default()
            },
        }
    }

    fn push(&self, local: &str, remote: &str) -> BridgeOutput {
        let mut data = match std::fs::read(local) {
            Ok(data) => data,
            Err(e) => return failure(1, format!("adb: error: cannot stat '{}': {}", local, e)),
        };
        if self.short_pushes.load(Ordering::SeqCst) {
            data.truncate(data.len() / 2);
        }
        let bytes = data.len();
        self.put_remote(remote, &data);
        text(format!("{}: 1 file pushed, 0 skipped. ({} bytes)\n", local, bytes))
    }

    fn pull(&self, remote: &str, local: &str) -> BridgeOutput {
        let Some(mut data) = self.remote_file(remote) else {
            return failure(1, format!("adb: error: failed to stat remote object '{}': No such file or directory", remote));
        };
        let partial = self.failing_pulls.load(Ordering::SeqCst);
        if partial || self.short_pulls.load(Ordering::SeqCst) {
            data.truncate(data.len() / 2);
        }
        std::fs::write(local, &data).expect("write pulled file");
        if partial {
            return failure(1, "adb: error: remote read failed: I/O error".to_string());
        }
        text(format!("{}: 1 file pulled, 0 skipped.\n", remote))
    }

    fn stat(&self, field: &str, path: &str) -> BridgeOutput {
        let size = self.remote_file(path).map(|d| d.len());
        match (field, size) {
            ("%s", Some(size)) => text(format!("{}\n", size)),
            ("%F", Some(_)) => text("regular file\n"),
            ("%F", None) if self.dirs.contains(path.trim_end_matches('/')) => text("directory\n"),
            _ => failure(1, format!("stat: '{}': No such file or directory", path)),
        }
    }

    async fn shell(&self, command: &str) -> BridgeOutput {
        let words: Vec<&str> = command
            .split_whitespace()
            .map(|w| w.trim_matches('\''))
            .collect();
        match words.as_slice() {
            ["slow", ms, ..] => {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                text(format!("{}\n", command))
            }
            ["fail", code] => BridgeOutput {
                stderr: "command failed on device".into(),
                code: code.parse().unwrap_or(1),
                ..Default::default()
            },
            ["monkey", "-p", package, ..] if package.contains("missing") => {
                text("  bash arg: -p\n** No activities found to run, monkey aborted.\n")
            }
            ["monkey", ..] => text("  bash arg: -p\nEvents injected: 1\n"),
            ["am", "start", ..] => text("Starting: Intent { cmp=com.android.settings/.Settings }\n"),
            ["stat", "-c", field, path] => self.stat(field, path),
            ["mv", "-f", from, to] => {
                let mut files = self.files.lock().unwrap();
                match files.remove(*from) {
                    Some(data) => {
                        files.insert(to.to_string(), data);
                        text("")
                    }
                    None => failure(1, format!("mv: bad '{}': No such file or directory", from)),
                }
            }
            ["rm", "-f", path] => {
                self.files.lock().unwrap().remove(*path);
                text("")
            }
            ["wm", "size"] => text("Physical size: 1080x2400\n"),
            ["getprop"] => text(
                "[ro.build.version.release]: [14]\n\
                 [ro.build.version.sdk]: [34]\n\
                 [ro.product.manufacturer]: [Google]\n\
                 [ro.product.model]: [Pixel 7]\n\
                 [ro.serialno]: [28031FDH2004KX]\n",
            ),
            ["pm", "list", "packages", rest @ ..] => {
                let installed = [
                    ("com.android.settings", true),
                    ("com.example.app", false),
                    ("com.example.app.debug", false),
                ];
                let listed: String = installed
                    .iter()
                    .filter(|(name, system)| match rest {
                        ["-s"] => *system,
                        ["-3"] => !*system,
                        [filter] => name.contains(*filter),
                        _ => true,
                    })
                    .map(|(name, _)| format!("package:{}\n", name))
                    .collect();
                text(listed)
            }
            ["dumpsys", "window"] => text(
                "  mCurrentFocus=Window{4f1c u0 com.example.app/com.example.app.MainActivity}\n\
                 \x20 mFocusedApp=ActivityRecord{9a2 u0 com.example.app/.MainActivity t12}\n",
            ),
            ["logcat", "-b", buffer, "-d", "-t", _] => text(format!(
                "--------- beginning of {}\n\
                 10-18 09:00:00.000  1000  1000 I ActivityManager: Start proc com.example.app\n\
                 10-18 09:00:01.000  1200  1200 D WifiService: scan done\n",
                buffer
            )),
            _ => text(""),
        }
    }
}

#[async_trait]
impl BridgeRunner for FakeAdb {
    async fn run(&self, args: &[String]) -> std::io::Result<BridgeOutput> {
        let started = Instant::now();
        let (serial, argv) = split_serial(args);

        let result = if self.broken.load(Ordering::SeqCst) {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "usb transport lost",
            ))
        } else {
            Ok(self.answer(&argv).await)
        };

        self.calls.lock().unwrap().push(Call {
            serial,
            argv,
            started,
            finished: Instant::now(),
        });
        result
    }
}

fn split_serial(args: &[String]) -> (Option<String>, Vec<String>) {
    match args {
        [flag, serial, rest @ ..] if flag == "-s" => (Some(serial.clone()), rest.to_vec()),
        _ => (None, args.to_vec()),
    }
}

fn failure(code: i32, stderr: String) -> BridgeOutput {
    BridgeOutput {
        stderr,
        code,
        ..Default::default()
    }
}

fn text(s: impl Into<String>) -> BridgeOutput {
    BridgeOutput {
        stdout: s.into().into_bytes(),
        ..Default::default()
    }
}

fn screen_png() -> Vec<u8> {
    // Hashed noise, so every patch of the screen is distinct
    let img = RgbImage::from_fn(48, 32, |x, y| {
        let mut h = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263);
        h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
        Rgb([(h >> 24) as u8, (h >> 16) as u8, (h >> 8) as u8])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode screen");
    buf
}

/// OCR engine returning a fixed set of words
pub struct FixedOcr(pub Vec<TextEntry>);

#[async_trait]
impl OcrEngine for FixedOcr {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn availability(&self) -> Availability {
        Availability::Available
    }

    async fn recognize(&self, _png: &[u8], _language: &str) -> Result<Vec<TextEntry>, OcrError> {
        Ok(self.0.clone())
    }
}

pub fn dispatcher(
    adb: &Arc<FakeAdb>,
    policy: BusyPolicy,
    ocr: Option<Arc<dyn OcrEngine>>,
) -> Arc<Dispatcher> {
    dispatcher_with_deadline(adb, policy, ocr, Duration::from_secs(2))
}

/// Three attempts per call, each bounded by `timeout`
pub fn dispatcher_with_deadline(
    adb: &Arc<FakeAdb>,
    policy: BusyPolicy,
    ocr: Option<Arc<dyn OcrEngine>>,
    timeout: Duration,
) -> Arc<Dispatcher> {
    let bridge = BridgeAdapter::new(
        adb.clone(),
        RetryPolicy {
            timeout,
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        },
    );
    Arc::new(Dispatcher::new(
        Arc::new(DeviceRegistry::new(bridge, policy, None)),
        Arc::new(RecognitionPipeline::new(ocr, Some(TemplateMatcher::new(0)))),
    ))
}

pub fn request(id: i64, method: &str, params: Value) -> CommandRequest {
    CommandRequest::new(id, method, params)
}
