//! Model file classifier
//!
//! Detection order:
//! 1. Magic bytes in the file header
//! 2. File extension
//! 3. Size heuristic (small files are assumed to target the helper binary)
//!
//! The result is a pure function of the file's name, size and leading bytes.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};

/// GGUF container magic (helper-binary runtimes)
const GGUF_MAGIC: &[u8; 4] = b"GGUF";
/// ORT flatbuffer file identifier, stored at offset 4
const ORT_FLATBUFFER_ID: &[u8; 4] = b"ORTM";
/// Protobuf tag for `ModelProto.ir_version` (field 1, varint)
const ONNX_IR_VERSION_TAG: u8 = 0x08;
/// Protobuf tag for `ModelProto.producer_name` (field 2, length-delimited)
const ONNX_PRODUCER_TAG: u8 = 0x12;
/// Highest ONNX IR version we accept as a single-byte varint
const ONNX_MAX_IR_VERSION: u8 = 0x20;

const HEADER_LEN: usize = 8;

/// Default size below which an unidentified model is assumed to be a
/// helper-binary model (100 MB)
pub const DEFAULT_HEURISTIC_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Quantization tokens recognised in file names, longest first
const QUANT_TOKENS: &[&str] = &[
    "q4_k_m", "q4_k_s", "q5_k_m", "q5_k_s", "q6_k", "q8_0", "q4_0", "q4_1", "q5_0", "q5_1",
    "fp32", "fp16", "bf16", "f32", "f16", "int8", "uint8", "int4", "quant",
];

/// Native model format declared for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    /// Runs in process on the numeric runtime (ONNX / ORT)
    NumericRuntimeNative,
    /// Runs in the external helper binary (GGUF / GGML)
    HelperBinaryNative,
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFormat::NumericRuntimeNative => write!(f, "numeric-runtime-native"),
            ModelFormat::HelperBinaryNative => write!(f, "helper-binary-native"),
        }
    }
}

/// How a descriptor's format was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationMethod {
    MagicBytes,
    Extension,
    SizeHeuristic,
}

impl std::fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationMethod::MagicBytes => write!(f, "magic-bytes"),
            ClassificationMethod::Extension => write!(f, "extension"),
            ClassificationMethod::SizeHeuristic => write!(f, "size-heuristic"),
        }
    }
}

/// Classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Files smaller than this with no magic and no known extension are
    /// classified as helper-binary models
    pub heuristic_size_threshold_bytes: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heuristic_size_threshold_bytes: DEFAULT_HEURISTIC_SIZE_THRESHOLD,
        }
    }
}

/// Identifies a model file. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    path: PathBuf,
    format: ModelFormat,
    quantization: String,
    size_bytes: u64,
    method: ClassificationMethod,
}

impl ModelDescriptor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    pub fn quantization(&self) -> &str {
        &self.quantization
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn method(&self) -> ClassificationMethod {
        self.method
    }

    /// True when only the size heuristic decided the format
    pub fn is_heuristic(&self) -> bool {
        self.method == ClassificationMethod::SizeHeuristic
    }

    /// File name without directories, for log fields and slot names
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Classify a model file
pub fn classify(path: &Path, config: &ClassifierConfig) -> EngineResult<ModelDescriptor> {
    let unrecognized = |reason: String| EngineError::UnrecognizedFormat {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| unrecognized(format!("cannot stat: {e}")))?;
    if !metadata.is_file() {
        return Err(unrecognized("not a regular file".to_string()));
    }
    let size_bytes = metadata.len();
    if size_bytes == 0 {
        return Err(unrecognized("file is empty".to_string()));
    }

    let header = read_header(path).map_err(|e| unrecognized(format!("cannot read header: {e}")))?;
    let (format, method) = detect(path, &header, size_bytes, config);

    let descriptor = ModelDescriptor {
        path: path.to_path_buf(),
        format,
        quantization: quantization_label(path),
        size_bytes,
        method,
    };

    if descriptor.is_heuristic() {
        warn!(
            model = %descriptor.file_name(),
            format = %format,
            size_bytes,
            "Model classified by size heuristic"
        );
    } else {
        debug!(
            model = %descriptor.file_name(),
            format = %format,
            method = %method,
            "Model classified"
        );
    }

    Ok(descriptor)
}

/// Classify every regular file in `dir`, skipping unrecognized files.
///
/// Results are ordered by file name.
pub fn discover_models(dir: &Path, config: &ClassifierConfig) -> EngineResult<Vec<ModelDescriptor>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::io(&format!("reading model directory {}", dir.display()), e))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut descriptors = Vec::with_capacity(paths.len());
    for path in paths {
        match classify(&path, config) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => warn!("Skipping model file {:?}: {}", path, e),
        }
    }

    info!(
        "Discovered {} model(s) in {:?}",
        descriptors.len(),
        dir
    );
    Ok(descriptors)
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.by_ref().take(HEADER_LEN as u64).read_to_end(&mut header)?;
    Ok(header)
}

fn detect(
    path: &Path,
    header: &[u8],
    size_bytes: u64,
    config: &ClassifierConfig,
) -> (ModelFormat, ClassificationMethod) {
    if let Some(format) = format_from_magic(header) {
        return (format, ClassificationMethod::MagicBytes);
    }
    if let Some(format) = format_from_extension(path) {
        return (format, ClassificationMethod::Extension);
    }

    let format = if size_bytes < config.heuristic_size_threshold_bytes {
        ModelFormat::HelperBinaryNative
    } else {
        ModelFormat::NumericRuntimeNative
    };
    (format, ClassificationMethod::SizeHeuristic)
}

fn format_from_magic(header: &[u8]) -> Option<ModelFormat> {
    if header.len() >= 4 && &header[..4] == GGUF_MAGIC {
        return Some(ModelFormat::HelperBinaryNative);
    }
    if header.len() >= 8 && &header[4..8] == ORT_FLATBUFFER_ID {
        return Some(ModelFormat::NumericRuntimeNative);
    }
    if header.len() >= 3
        && header[0] == ONNX_IR_VERSION_TAG
        && (1..=ONNX_MAX_IR_VERSION).contains(&header[1])
        && header[2] == ONNX_PRODUCER_TAG
    {
        return Some(ModelFormat::NumericRuntimeNative);
    }
    None
}

fn format_from_extension(path: &Path) -> Option<ModelFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "onnx" | "ort" => Some(ModelFormat::NumericRuntimeNative),
        "gguf" | "ggml" => Some(ModelFormat::HelperBinaryNative),
        _ => None,
    }
}

fn quantization_label(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let tokens: Vec<&str> = stem.split(['-', '.', ' ']).collect();
    for quant in QUANT_TOKENS {
        // Tokens may themselves contain '_' (q8_0), so match on the
        // hyphen/dot-separated pieces and their '_' suffixes.
        let found = tokens.iter().any(|token| {
            *token == *quant
                || token.ends_with(&format!("_{quant}"))
                || token.starts_with(&format!("{quant}_"))
        });
        if found {
            return (*quant).to_string();
        }
    }
    "unknown".to_string()
}
