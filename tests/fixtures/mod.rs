//! Test Fixtures Module
//!
//! Shared fixtures for the integration tests:
//! - A scriptable session loader for the native runtime backend
//! - Model and voice file writers
//! - Shell scripts standing in for the helper binary

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use voxcore::core::backend::native::{AcousticSession, SessionLoader};
use voxcore::core::cache::{ManifestEntry, VoiceManifest, sha256_hex};
use voxcore::{BackendOptions, ClassifierConfig, ModelDescriptor, classify};

/// Embedding width used by every fixture voice
pub const DIM: usize = 8;

/// Shared, mutable behavior of every session a [`ScriptedLoader`] creates
#[derive(Default)]
pub struct Script {
    /// Forward passes started, across all sessions
    pub runs: AtomicUsize,
    /// Model file names whose sessions fail every forward pass
    pub failing_models: Mutex<HashSet<String>>,
    /// Model file names that cannot be loaded
    pub broken_models: Mutex<HashSet<String>>,
    /// Time each forward pass blocks for
    pub delay: Mutex<Duration>,
}

impl Script {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn fail_model(&self, file_name: &str) {
        self.failing_models.lock().insert(file_name.to_string());
    }

    pub fn heal_model(&self, file_name: &str) {
        self.failing_models.lock().remove(file_name);
    }

    pub fn break_model(&self, file_name: &str) {
        self.broken_models.lock().insert(file_name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

struct ScriptedSession {
    model: String,
    script: Arc<Script>,
}

impl AcousticSession for ScriptedSession {
    fn run(&mut self, tokens: &[i64], style: &[f32], speed: f32) -> anyhow::Result<Vec<f32>> {
        self.script.runs.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.script.failing_models.lock().contains(&self.model) {
            anyhow::bail!("{} produced NaNs", self.model);
        }
        let level = style.first().copied().unwrap_or(0.1);
        let len = ((tokens.len() * 240) as f32 / speed) as usize;
        Ok((0..len).map(|i| level * ((i % 48) as f32 / 48.0 - 0.5)).collect())
    }
}

/// Session loader whose sessions follow a shared [`Script`]
pub struct ScriptedLoader {
    pub script: Arc<Script>,
}

impl ScriptedLoader {
    pub fn new() -> (Arc<Self>, Arc<Script>) {
        let script = Arc::new(Script::default());
        (
            Arc::new(Self {
                script: script.clone(),
            }),
            script,
        )
    }
}

impl SessionLoader for ScriptedLoader {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        _options: &BackendOptions,
    ) -> anyhow::Result<Box<dyn AcousticSession>> {
        let model = descriptor.file_name();
        if self.script.broken_models.lock().contains(&model) {
            anyhow::bail!("cannot map weights for {model}");
        }
        Ok(Box::new(ScriptedSession {
            model,
            script: self.script.clone(),
        }))
    }
}

/// Write a small ONNX-looking model file and classify it
pub fn onnx_model(dir: &Path, name: &str) -> ModelDescriptor {
    let path = dir.join(name);
    std::fs::write(&path, [0x08, 0x07, 0x12, 0x04, b't', b'e', b's', b't']).unwrap();
    classify(&path, &ClassifierConfig::default()).unwrap()
}

/// Write a small GGUF model file and classify it
pub fn gguf_model(dir: &Path, name: &str) -> ModelDescriptor {
    let path = dir.join(name);
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00padding").unwrap();
    classify(&path, &ClassifierConfig::default()).unwrap()
}

/// Voice file bytes: `rows` rows of `DIM` little-endian floats
pub fn voice_bytes(rows: usize, value: f32) -> Vec<u8> {
    (0..rows * DIM)
        .map(|i| value + i as f32 * 0.001)
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

/// Write `<id>.bin` into `dir`, returning its manifest entry
pub fn write_voice(dir: &Path, id: &str, rows: usize, value: f32) -> ManifestEntry {
    let bytes = voice_bytes(rows, value);
    let path = dir.join(format!("{id}.bin"));
    std::fs::write(&path, &bytes).unwrap();
    ManifestEntry {
        path,
        sha256: sha256_hex(&bytes),
        size_bytes: Some(bytes.len() as u64),
    }
}

/// Write voices with the given ids and return a manifest over them
pub fn voice_manifest(dir: &Path, ids: &[&str]) -> VoiceManifest {
    let mut manifest = VoiceManifest::default();
    for (i, id) in ids.iter().enumerate() {
        let entry = write_voice(dir, id, 4, 0.2 + i as f32 * 0.1);
        manifest.voices.insert(id.to_string(), entry);
    }
    manifest
}

/// Write a 16-bit mono WAV of a short ramp
pub fn write_wav(path: &Path, samples: usize, sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..samples {
        writer.write_sample(((i % 100) as i16 - 50) * 100).unwrap();
    }
    writer.finalize().unwrap();
}

/// Write a shell script run as `/bin/sh <script> <helper args>`
pub fn helper_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

/// Helper that copies a prepared WAV to `--output` and logs each call
pub fn wav_helper(dir: &Path, samples: usize, sample_rate: u32) -> (PathBuf, PathBuf) {
    let wav = dir.join("prepared.wav");
    write_wav(&wav, samples, sample_rate);
    let calls = dir.join("calls.log");
    let script = helper_script(
        dir,
        "wav_helper.sh",
        &format!(
            r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo call >> "{calls}"
sleep 0.2
cp "{wav}" "$out""#,
            calls = calls.display(),
            wav = wav.display()
        ),
    );
    (script, calls)
}

/// Helper that records its pid and never finishes
pub fn hanging_helper(dir: &Path) -> (PathBuf, PathBuf) {
    let pid_file = dir.join("helper.pid");
    let script = helper_script(
        dir,
        "hanging_helper.sh",
        &format!("echo $$ > \"{}\"\nexec sleep 30", pid_file.display()),
    );
    (script, pid_file)
}

/// Helper that writes to stderr and exits non-zero
pub fn failing_helper(dir: &Path) -> PathBuf {
    helper_script(
        dir,
        "failing_helper.sh",
        "echo \"model exploded\" >&2\nexit 3",
    )
}

/// How a [`forking_helper`] finishes after starting its background child
pub enum ForkedExit {
    /// Copy the prepared WAV to `--output` and exit 0
    Output,
    /// Wait on the background child forever
    Hang,
    /// Write to stderr and exit non-zero
    Fail,
}

/// Helper that leaves a long `sleep` running in the background, sharing its
/// stderr, and records that child's pid
pub fn forking_helper(dir: &Path, exit: ForkedExit) -> (PathBuf, PathBuf) {
    let wav = dir.join("prepared.wav");
    write_wav(&wav, 480, 24000);
    let bg_pid = dir.join("background.pid");
    let tail = match exit {
        ForkedExit::Output => format!("cp \"{}\" \"$out\"\nexit 0", wav.display()),
        ForkedExit::Hang => "wait".to_string(),
        ForkedExit::Fail => "echo \"decoder crashed\" >&2\nexit 4".to_string(),
    };
    let script = helper_script(
        dir,
        "forking_helper.sh",
        &format!(
            r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
sleep 30 &
echo $! > "{bg_pid}"
{tail}"#,
            bg_pid = bg_pid.display(),
        ),
    );
    (script, bg_pid)
}

/// Wait up to two seconds for `pid` to exit. A zombie counts as exited:
/// it only waits for whoever inherited it to reap it.
pub fn process_exits(pid: &str) -> bool {
    let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let exited = match std::fs::read_to_string(&stat) {
            Err(_) => true,
            Ok(line) => line
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        };
        if exited {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Backend options running `script` through `/bin/sh`
pub fn shell_helper_options(script: &Path, scratch: &Path, timeout: Duration) -> BackendOptions {
    BackendOptions {
        helper_path: Some(PathBuf::from("/bin/sh")),
        helper_args: vec![script.display().to_string()],
        helper_timeout: timeout,
        scratch_dir: Some(scratch.to_path_buf()),
        ..Default::default()
    }
}

/// Number of lines in a call log, zero if it does not exist yet
pub fn call_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
