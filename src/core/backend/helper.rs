//! Helper-binary backend
//!
//! Each inference is a scoped resource acquisition:
//!
//! 1. create a private temporary directory under the scratch directory
//! 2. write the phoneme, token and voice inputs into it
//! 3. spawn the helper with a bounded argument list
//! 4. wait with a hard timeout, killing and reaping the process on expiry
//! 5. read the produced WAV file
//!
//! The temporary directory is removed when the call returns on any path. On
//! unix the helper leads its own process group, and the whole group is
//! killed once the call returns, whether it succeeded, failed, timed out or
//! was dropped by its last waiter. Anything the helper forked goes with it.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BackendDescription, BackendOptions, BackendVariant, InferenceBackend};
use crate::core::audio::RawAudio;
use crate::core::cache::VoiceEmbedding;
use crate::core::model::ModelDescriptor;
use crate::core::types::{InferenceParams, PhonemeSequence};
use crate::errors::{EngineError, EngineResult};

/// Upper bound on captured helper stderr
const MAX_STDERR_BYTES: u64 = 16 * 1024;
/// Time allowed to drain stderr after the helper exits
const STDERR_GRACE: Duration = Duration::from_millis(250);

const PHONEMES_FILE: &str = "input.phonemes";
const TOKENS_FILE: &str = "input.tokens";
const VOICE_FILE: &str = "voice.f32";
const OUTPUT_FILE: &str = "output.wav";

/// Backend delegating inference to an external helper binary
#[derive(Debug)]
pub struct HelperProcessBackend {
    descriptor: ModelDescriptor,
    executable: PathBuf,
    leading_args: Vec<String>,
    timeout: Duration,
    scratch_dir: PathBuf,
    sample_rate: u32,
    unloaded: AtomicBool,
}

impl HelperProcessBackend {
    /// Validate the executable and the model file. No long-running work.
    pub async fn load(descriptor: &ModelDescriptor, options: &BackendOptions) -> EngineResult<Self> {
        let executable = options
            .helper_path
            .clone()
            .ok_or_else(|| load_error("no helper executable configured"))?;

        let metadata = tokio::fs::metadata(&executable).await.map_err(|e| {
            load_error(format!(
                "helper executable {} is not accessible: {e}",
                executable.display()
            ))
        })?;
        if !metadata.is_file() {
            return Err(load_error(format!(
                "helper executable {} is not a file",
                executable.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(load_error(format!(
                    "helper {} is not executable",
                    executable.display()
                )));
            }
        }

        tokio::fs::File::open(descriptor.path()).await.map_err(|e| {
            load_error(format!(
                "model {} is not readable: {e}",
                descriptor.path().display()
            ))
        })?;

        let scratch_dir = options
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&scratch_dir).await.map_err(|e| {
            load_error(format!(
                "scratch directory {} is not usable: {e}",
                scratch_dir.display()
            ))
        })?;

        info!(
            model = %descriptor.path().display(),
            helper = %executable.display(),
            timeout_ms = options.helper_timeout.as_millis() as u64,
            "Helper process backend ready"
        );

        Ok(Self {
            descriptor: descriptor.clone(),
            executable,
            leading_args: options.helper_args.clone(),
            timeout: options.helper_timeout,
            scratch_dir,
            sample_rate: options.sample_rate,
            unloaded: AtomicBool::new(false),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn build_command(&self, workdir: &Path, params: InferenceParams) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.leading_args)
            .arg("--model")
            .arg(self.descriptor.path())
            .arg("--voice")
            .arg(workdir.join(VOICE_FILE))
            .arg("--phonemes")
            .arg(workdir.join(PHONEMES_FILE))
            .arg("--tokens")
            .arg(workdir.join(TOKENS_FILE))
            .arg("--output")
            .arg(workdir.join(OUTPUT_FILE))
            .arg("--speed")
            .arg(format!("{:.3}", params.speed))
            .arg("--sample-rate")
            .arg(self.sample_rate.to_string())
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn write_inputs(
        workdir: &Path,
        phonemes: &PhonemeSequence,
        voice: &VoiceEmbedding,
    ) -> EngineResult<()> {
        let tokens = phonemes
            .tokens()
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        tokio::fs::write(workdir.join(PHONEMES_FILE), phonemes.phonemes())
            .await
            .map_err(|e| inference_error(format!("failed to write phonemes: {e}")))?;
        tokio::fs::write(workdir.join(TOKENS_FILE), tokens)
            .await
            .map_err(|e| inference_error(format!("failed to write tokens: {e}")))?;
        tokio::fs::write(workdir.join(VOICE_FILE), voice.to_le_bytes())
            .await
            .map_err(|e| inference_error(format!("failed to write voice: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for HelperProcessBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::HelperProcess
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn infer(
        &self,
        phonemes: &PhonemeSequence,
        voice: &VoiceEmbedding,
        params: InferenceParams,
    ) -> EngineResult<RawAudio> {
        if phonemes.phonemes().trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "helper process requires a phoneme string".to_string(),
            ));
        }
        if self.unloaded.load(Ordering::Acquire) {
            return Err(inference_error("backend has been unloaded"));
        }

        // Removed on drop, whichever way this function exits
        let workdir = tempfile::Builder::new()
            .prefix("voxcore-helper-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| inference_error(format!("failed to create temporary directory: {e}")))?;

        Self::write_inputs(workdir.path(), phonemes, voice).await?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut child = self
            .build_command(workdir.path(), params)
            .spawn()
            .map_err(|e| inference_error(format!("failed to spawn helper: {e}")))?;
        let pid = child.id();
        // Dropped before `workdir`
        let mut group = ProcessGroup::new(pid);

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut captured = String::new();
                let _ = stderr.take(MAX_STDERR_BYTES).read_to_string(&mut captured).await;
                captured
            })
        });

        let waited = tokio::time::timeout_at(deadline, child.wait()).await;
        group.kill();
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let _ = child.kill().await;
                return Err(inference_error(format!("failed to wait for helper: {e}")));
            }
            Err(_) => {
                if let Some(task) = stderr_task {
                    task.abort();
                }
                // kill() also reaps the child, so nothing is left in the process table
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill timed out helper");
                }
                warn!(
                    pid = ?pid,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Helper process timed out and was killed"
                );
                return Err(EngineError::Timeout {
                    variant: BackendVariant::HelperProcess,
                    elapsed: self.timeout,
                });
            }
        };

        // Something outside the group may still hold the pipe open
        let drain_until = deadline.max(Instant::now() + STDERR_GRACE);
        let stderr = match stderr_task {
            Some(mut task) => match tokio::time::timeout_at(drain_until, &mut task).await {
                Ok(captured) => captured.unwrap_or_default(),
                Err(_) => {
                    task.abort();
                    debug!(pid = ?pid, "Helper stderr still open after exit; not captured");
                    String::new()
                }
            },
            None => String::new(),
        };

        if !status.success() {
            return Err(inference_error(format!(
                "helper exited with {status}: {}",
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::read(workdir.path().join(OUTPUT_FILE))
            .await
            .map_err(|e| inference_error(format!("helper produced no output file: {e}")))?;
        let audio = decode_wav(&bytes)?;

        debug!(
            pid = ?pid,
            samples = audio.samples.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Helper inference complete"
        );

        Ok(audio)
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            device_type: "external-process".to_string(),
            approx_memory_bytes: self.descriptor.size_bytes(),
            supports_streaming: false,
        }
    }

    async fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            warn!(
                model = %self.descriptor.path().display(),
                "unload called twice on helper process backend; ignoring"
            );
            return;
        }
        info!(
            model = %self.descriptor.path().display(),
            "Helper process backend unloaded"
        );
    }
}

/// The helper's process group, killed at most once and always on drop
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    fn kill(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // The helper was spawned with process_group(0), so its pid is the group id
            let rc = unsafe { libc::killpg(leader as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pgid = leader, error = %err, "Failed to kill helper process group");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn load_error(reason: impl Into<String>) -> EngineError {
    EngineError::Load {
        variant: BackendVariant::HelperProcess,
        reason: reason.into(),
    }
}

fn inference_error(reason: impl Into<String>) -> EngineError {
    EngineError::Inference {
        variant: BackendVariant::HelperProcess,
        reason: reason.into(),
    }
}

/// Decode a helper WAV file to mono f32
fn decode_wav(bytes: &[u8]) -> EngineResult<RawAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| inference_error(format!("invalid WAV output: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| inference_error(format!("corrupt WAV output: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| inference_error(format!("corrupt WAV output: {e}")))?
        }
    };

    if interleaved.is_empty() {
        return Err(inference_error("helper produced empty audio"));
    }

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(RawAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}
