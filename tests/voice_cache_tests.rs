//! Voice embedding cache tests: integrity, eviction, pinning and coalescing.
//!
//! Run: cargo test --test voice_cache_tests

mod fixtures;

use std::sync::Arc;

use fixtures::*;
use voxcore::core::cache::{ManifestSource, VoiceManifest};
use voxcore::{EngineError, ErrorCategory, VoiceCacheConfig, VoiceEmbeddingCache};

fn config(capacity_bytes: u64) -> VoiceCacheConfig {
    VoiceCacheConfig {
        capacity_bytes,
        embedding_dim: DIM,
    }
}

#[tokio::test]
async fn test_truncated_file_fails_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    let path = manifest.get("af_heart").unwrap().path.clone();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 3);
    std::fs::write(&path, &bytes).unwrap();

    let cache = VoiceEmbeddingCache::new(manifest, config(1 << 20));
    let err = cache.get("af_heart").await.unwrap_err();

    assert!(matches!(err, EngineError::Integrity { ref voice_id, .. } if voice_id == "af_heart"));
    assert_eq!(err.category(), ErrorCategory::Integrity);
    assert!(cache.resident().is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_fails_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    let entry = manifest.get("af_heart").unwrap().clone();

    // Same length, different content
    std::fs::write(&entry.path, voice_bytes(4, 0.7)).unwrap();

    let cache = VoiceEmbeddingCache::new(manifest, config(1 << 20));
    match cache.get("af_heart").await.unwrap_err() {
        EngineError::Integrity {
            expected, actual, ..
        } => {
            assert_eq!(expected, entry.sha256);
            assert_ne!(actual, entry.sha256);
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_load_is_retried_on_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    let entry = manifest.get("af_heart").unwrap().clone();
    let good = std::fs::read(&entry.path).unwrap();
    std::fs::write(&entry.path, b"garbage").unwrap();

    let cache = VoiceEmbeddingCache::new(manifest, config(1 << 20));
    assert!(cache.get("af_heart").await.is_err());

    std::fs::write(&entry.path, &good).unwrap();
    let embedding = cache.get("af_heart").await.unwrap();
    assert_eq!(embedding.checksum(), entry.sha256);
    assert_eq!(embedding.rows(), 4);
}

#[tokio::test]
async fn test_missing_file_is_voice_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    std::fs::remove_file(&manifest.get("af_heart").unwrap().path).unwrap();

    let cache = VoiceEmbeddingCache::new(manifest, config(1 << 20));
    let err = cache.get("af_heart").await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::VoiceNotFound);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_lru_eviction_skips_pinned_voices() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["a1", "a2", "a3"]);

    // Room for two embeddings of equal size
    let sizing = VoiceEmbeddingCache::new(manifest.clone(), config(1 << 20));
    let one = sizing.get("a1").await.unwrap().byte_size();
    let cache = VoiceEmbeddingCache::new(manifest, config(one * 2 + one / 2));

    let report = cache.preload(["a1"]).await;
    assert_eq!(report.loaded, vec!["a1".to_string()]);

    cache.get("a2").await.unwrap();
    cache.get("a3").await.unwrap();

    let resident = cache.resident();
    assert!(resident.contains(&"a1".to_string()));
    assert!(resident.contains(&"a3".to_string()));
    assert!(!resident.contains(&"a2".to_string()));

    let stats = cache.stats();
    assert_eq!(stats.pinned, 1);
    assert_eq!(stats.evictions, 1);
    assert!(stats.bytes <= stats.capacity_bytes);
}

#[tokio::test]
async fn test_preload_reports_failures_without_pinning_them() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    let cache = VoiceEmbeddingCache::new(manifest, config(1 << 20));

    let report = cache.preload(["af_heart", "nobody"]).await;

    assert_eq!(report.loaded, vec!["af_heart".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "nobody");
    assert!(cache.is_pinned("af_heart"));
    assert!(!cache.is_pinned("nobody"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_load_once() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart"]);
    let cache = Arc::new(VoiceEmbeddingCache::new(manifest, config(1 << 20)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.get("af_heart").await.unwrap()
        }));
    }
    let mut embeddings = Vec::new();
    for handle in handles {
        embeddings.push(handle.await.unwrap());
    }

    assert!(embeddings.iter().all(|e| Arc::ptr_eq(e, &embeddings[0])));
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.coalesced, 15);
}

#[tokio::test]
async fn test_manifest_file_reload_invalidates_changed_entries() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = voice_manifest(dir.path(), &["af_heart", "am_adam"]);
    let manifest_path = dir.path().join("manifest.json");
    manifest.save(&manifest_path).unwrap();

    let cache =
        VoiceEmbeddingCache::from_source(ManifestSource::File(manifest_path.clone()), config(1 << 20))
            .unwrap();
    cache.get("af_heart").await.unwrap();
    cache.get("am_adam").await.unwrap();

    // Replace one voice and publish a new manifest for it
    let mut next = VoiceManifest::default();
    next.voices
        .insert("af_heart".to_string(), write_voice(dir.path(), "af_heart", 4, 0.5));
    next.voices
        .insert("am_adam".to_string(), manifest.get("am_adam").unwrap().clone());

    let invalidated = cache.install_manifest(next);

    assert_eq!(invalidated, vec!["af_heart".to_string()]);
    assert_eq!(cache.resident(), vec!["am_adam".to_string()]);

    let reloaded = cache.get("af_heart").await.unwrap();
    assert!((reloaded.values()[0] - 0.5).abs() < f32::EPSILON);
}
