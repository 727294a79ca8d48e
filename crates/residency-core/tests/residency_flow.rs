//! End-to-end flows through the wired residency manager.

use async_trait::async_trait;
use bytes::Bytes;
use residency_core::monitor::SharedProbe;
use residency_core::{
    CancellationToken, Checksum, ChunkOutcome, ComponentKind, ComponentSpec, LoadRequest, LoadState,
    MappedArtifact, ModelConstructor, ModelHandle, Residency, ResidencyConfig, ResidencyError,
    ResidencyState, Tier,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Maps `<dir>/<name>.bin` as the model handle.
struct MappedConstructor {
    dir: PathBuf,
}

#[async_trait]
impl ModelConstructor for MappedConstructor {
    async fn construct(
        &self,
        name: &str,
        _language: &str,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Arc<dyn ModelHandle>> {
        let artifact = MappedArtifact::open(self.dir.join(format!("{}.bin", name)))?;
        Ok(Arc::new(artifact))
    }
}

fn config() -> ResidencyConfig {
    let mut config = ResidencyConfig::default();
    config.monitor.memory_budget_bytes = 10_000;
    config.monitor.sample_ttl_ms = 0;
    config.cache.memory_budget_bytes = 1_000;
    config.cache.secondary_budget_bytes = 100_000;
    config.loader.chunk_size_bytes = 16;
    config.lifecycle.default_memory_limit_bytes = 100;
    config
}

fn build(root: &TempDir, probe: SharedProbe) -> Residency {
    Residency::builder(Arc::new(MappedConstructor {
        dir: root.path().join("artifacts"),
    }))
    .config(config())
    .root(root.path())
    .memory_probe(Arc::new(probe))
    .build()
    .unwrap()
}

#[tokio::test]
async fn interrupted_load_resumes_and_becomes_the_active_model() {
    let root = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..100u8).collect();
    let target = root.path().join("artifacts").join("tiny.bin");
    let checksum = Checksum::sha256(&payload);

    {
        let residency = build(&root, SharedProbe::new(0, 0, 100_000));
        let loader = residency.open_loader("tiny").unwrap();
        loader
            .start_loading(&target, payload.len() as u64, Some(checksum.clone()))
            .unwrap();
        for (index, chunk) in payload.chunks(16).enumerate().take(3) {
            loader.load_chunk(index as u64, chunk).unwrap();
        }
        // Dropped here, as if the process died mid-load.
    }

    let residency = build(&root, SharedProbe::new(0, 0, 100_000));
    let loader = residency.open_loader("tiny").unwrap();
    let remaining = loader.resume_loading().unwrap();
    assert_eq!(remaining, vec![3, 4, 5, 6]);

    let mut outcome = None;
    for index in remaining {
        let start = index as usize * 16;
        let end = (start + 16).min(payload.len());
        outcome = Some(loader.load_chunk(index, &payload[start..end]).unwrap());
    }
    assert!(matches!(outcome, Some(ChunkOutcome::Finalized { .. })));
    assert_eq!(loader.progress().unwrap().state, LoadState::Complete);
    assert_eq!(std::fs::read(&target).unwrap(), payload);

    residency.load(LoadRequest::new("tiny", "en")).await.unwrap();
    let current = residency.lifecycle().current().unwrap();
    assert_eq!(current.name, "tiny");
    assert_eq!(current.memory_usage_bytes, 100);
    assert_eq!(residency.preloader().stats().recorded, 1);
}

#[tokio::test]
async fn missing_artifact_is_a_construction_failure() {
    let root = TempDir::new().unwrap();
    let residency = build(&root, SharedProbe::new(0, 0, 100_000));

    let result = residency.load(LoadRequest::new("absent", "en")).await;
    assert!(matches!(result, Err(ResidencyError::ConstructionFailure { .. })));
    assert_eq!(residency.lifecycle().state("absent"), ResidencyState::Absent);
}

#[test]
fn secondary_entries_survive_restart() {
    let root = TempDir::new().unwrap();
    {
        let residency = build(&root, SharedProbe::new(0, 0, 100_000));
        let cache = residency.cache();
        cache.put("big", Bytes::from(vec![7u8; 2_000]), None).unwrap();
        assert_eq!(cache.tier_of("big"), Some(Tier::Secondary));
        cache.put("small", Bytes::from_static(b"hot"), None).unwrap();
        assert!(cache.demote("small").unwrap());
    }

    let residency = build(&root, SharedProbe::new(0, 0, 100_000));
    let cache = residency.cache();
    assert_eq!(cache.recovery().unwrap().recovered, 2);
    assert_eq!(cache.get("big").unwrap().unwrap().len(), 2_000);
    assert_eq!(cache.get("small").unwrap().unwrap(), Bytes::from_static(b"hot"));
    // Small enough to promote on a hit.
    assert_eq!(cache.tier_of("small"), Some(Tier::Memory));
}

#[tokio::test]
async fn maintenance_unloads_components_under_pressure() {
    let root = TempDir::new().unwrap();
    let probe = SharedProbe::new(0, 50, 100);
    let mut config = config();
    config.maintenance.interval_secs = 1;
    let residency = Residency::builder(Arc::new(MappedConstructor {
        dir: root.path().join("artifacts"),
    }))
    .config(config)
    .root(root.path())
    .memory_probe(Arc::new(probe.clone()))
    .build()
    .unwrap();

    let components = residency.components();
    components
        .register(ComponentSpec::new("embed", ComponentKind::Embedding, 40))
        .unwrap();
    components
        .register(ComponentSpec::new("block.0", ComponentKind::Attention, 30).depends_on("embed"))
        .unwrap();

    let maintenance = residency.start_maintenance();
    probe.set_system_used_bytes(95);

    let mut unloaded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !components.status("block.0").unwrap().is_loaded {
            unloaded = true;
            break;
        }
    }
    maintenance.shutdown().await;
    assert!(unloaded);

    // The dependency can only go after its dependent.
    let embed = components.status("embed").unwrap();
    let order = components.load_order(&["block.0"]).unwrap();
    assert_eq!(order, vec!["embed", "block.0"]);
    assert!(embed.dependents.contains(&"block.0".to_string()));
}

#[tokio::test]
async fn switching_language_feeds_usage_history() {
    let root = TempDir::new().unwrap();
    let artifacts = root.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();
    std::fs::write(artifacts.join("mistral-7b-instruct.bin"), [1u8; 10]).unwrap();
    let residency = build(&root, SharedProbe::new(0, 0, 100_000));

    residency.switch_to("en").await.unwrap();
    residency.switch_to("en").await.unwrap();
    assert_eq!(residency.lifecycle().current().unwrap().name, "mistral-7b-instruct");

    let stats = residency.preloader().stats();
    assert_eq!(stats.recorded, 2);
    assert_eq!(stats.tracked_artifacts, 1);
    assert!(matches!(
        residency.switch_to("tlh").await,
        Err(ResidencyError::Config { .. })
    ));
}
