//! Voice manifest: voice id → file path → SHA-256 checksum
//!
//! The manifest is the external contract for voice availability. It is
//! persisted as JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "voices": {
//!     "af_heart": { "path": "af_heart.bin", "sha256": "…", "size_bytes": 522240 }
//!   }
//! }
//! ```
//!
//! Relative paths are resolved against the manifest file's directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};

pub const MANIFEST_VERSION: u32 = 1;

/// File extension of raw voice embedding files
pub const VOICE_FILE_EXTENSION: &str = "bin";

/// One voice in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub voices: BTreeMap<String, ManifestEntry>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl Default for VoiceManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            voices: BTreeMap::new(),
        }
    }
}

impl VoiceManifest {
    /// Load a JSON manifest, resolving relative voice paths against its directory
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(&format!("reading manifest {}", path.display()), e))?;
        let mut manifest: VoiceManifest = serde_json::from_str(&contents).map_err(|e| {
            EngineError::InvalidConfiguration(format!(
                "invalid voice manifest {}: {e}",
                path.display()
            ))
        })?;

        if manifest.version != MANIFEST_VERSION {
            return Err(EngineError::InvalidConfiguration(format!(
                "unsupported voice manifest version {} in {}",
                manifest.version,
                path.display()
            )));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for entry in manifest.voices.values_mut() {
            if entry.path.is_relative() {
                entry.path = base.join(&entry.path);
            }
            entry.sha256 = entry.sha256.to_lowercase();
        }

        debug!(
            "Loaded voice manifest {:?} with {} voice(s)",
            path,
            manifest.voices.len()
        );
        Ok(manifest)
    }

    /// Build a manifest by hashing every voice file in `dir`.
    ///
    /// The voice id is the file stem.
    pub fn build_from_dir(dir: &Path) -> EngineResult<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| EngineError::io(&format!("reading voice directory {}", dir.display()), e))?;

        let mut voices = BTreeMap::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(VOICE_FILE_EXTENSION)
            {
                continue;
            }
            let Some(voice_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!("Skipping voice file with non UTF-8 name: {:?}", path);
                continue;
            };

            let data = std::fs::read(&path)
                .map_err(|e| EngineError::io(&format!("reading voice {}", path.display()), e))?;
            voices.insert(
                voice_id.to_string(),
                ManifestEntry {
                    sha256: sha256_hex(&data),
                    size_bytes: Some(data.len() as u64),
                    path,
                },
            );
        }

        info!("Indexed {} voice file(s) in {:?}", voices.len(), dir);
        Ok(Self {
            version: MANIFEST_VERSION,
            voices,
        })
    }

    /// Write the manifest as pretty JSON, storing paths relative to its directory when possible
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut portable = self.clone();
        for entry in portable.voices.values_mut() {
            if let Ok(relative) = entry.path.strip_prefix(base) {
                entry.path = relative.to_path_buf();
            }
        }

        let json = serde_json::to_string_pretty(&portable)
            .map_err(|e| EngineError::Io(format!("serializing manifest: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| EngineError::io(&format!("writing manifest {}", path.display()), e))
    }

    pub fn get(&self, voice_id: &str) -> Option<&ManifestEntry> {
        self.voices.get(voice_id)
    }

    pub fn contains(&self, voice_id: &str) -> bool {
        self.voices.contains_key(voice_id)
    }

    pub fn voice_ids(&self) -> impl Iterator<Item = &str> {
        self.voices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Voice ids whose entry differs in `next` or is missing from it
    pub fn changed_voices(&self, next: &VoiceManifest) -> Vec<String> {
        self.voices
            .iter()
            .filter(|(id, entry)| next.voices.get(*id) != Some(*entry))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Where the manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// A JSON manifest file
    File(PathBuf),
    /// A directory of voice files, hashed on every reload
    Directory(PathBuf),
}

impl ManifestSource {
    pub fn load(&self) -> EngineResult<VoiceManifest> {
        match self {
            ManifestSource::File(path) => VoiceManifest::from_file(path),
            ManifestSource::Directory(dir) => VoiceManifest::build_from_dir(dir),
        }
    }

    /// Latest modification time of the source, used to detect changes
    pub fn modified(&self) -> Option<SystemTime> {
        match self {
            ManifestSource::File(path) => std::fs::metadata(path).and_then(|m| m.modified()).ok(),
            ManifestSource::Directory(dir) => {
                let dir_time = std::fs::metadata(dir).and_then(|m| m.modified()).ok();
                let newest_file = std::fs::read_dir(dir)
                    .ok()?
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.metadata().and_then(|m| m.modified()).ok())
                    .max();
                dir_time.max(newest_file)
            }
        }
    }
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
