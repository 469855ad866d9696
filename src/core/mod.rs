pub mod audio;
pub mod backend;
pub mod cache;
pub mod engine;
pub mod fallback;
pub mod model;
pub mod types;

// Re-export commonly used types for convenience
pub use audio::{AudioBuffer, AudioFormat, RawAudio};
pub use backend::{
    BackendDescription, BackendFactory, BackendHandle, BackendOptions, BackendPreference,
    BackendVariant, InferenceBackend, SelectionPlan, SelectionRationale,
};
pub use cache::{
    CacheStats, Fingerprint, ResultCache, ResultSource, VoiceCacheConfig, VoiceEmbedding,
    VoiceEmbeddingCache, VoiceManifest,
};
pub use engine::{
    EngineCacheStats, EngineStatus, SynthesisEngine, SynthesisEngineBuilder, SynthesisOutput,
};
pub use fallback::{
    BackendCandidate, BackendHealthRecord, BackendLease, BackendStatus, FallbackManager,
    FallbackPolicy, HealthState, SlotPhase,
};
pub use model::{ClassifierConfig, ModelDescriptor, ModelFormat, classify, discover_models};
pub use types::{InferenceParams, PhonemeSequence, SynthesisParams};
