//! Space reclamation over real hydrated files

use nimbus_core::{classify::OpContext, domain::EntryState};
use nimbus_placeholder::{hydrated_usage, ReclaimManager, ReclaimPolicy};

use crate::common::Harness;

async fn hydrated_files(h: &Harness) -> Vec<nimbus_core::domain::SyncPath> {
    let mut paths = Vec::new();
    for name in ["a.bin", "b.bin", "c.bin"] {
        let (path, _) = h.seed_file(name, &[0xAB; 40]).await;
        h.machine.hydrate(&path, OpContext::new("hydrate")).await.unwrap();
        paths.push(path);
    }
    paths
}

fn policy(cache_max_bytes: u64, threshold_percent: u8) -> ReclaimPolicy {
    ReclaimPolicy {
        cache_max_bytes,
        threshold_percent,
        interval_minutes: 60,
    }
}

#[tokio::test]
async fn test_sweep_below_threshold_does_nothing() {
    let h = Harness::new().await;
    hydrated_files(&h).await;
    let manager = ReclaimManager::new(policy(1000, 80), h.machine.clone());

    let report = manager.run_sweep().await;

    assert_eq!(report.dehydrated_count, 0);
    assert_eq!(hydrated_usage(&h.machine.snapshot()), 120);
}

#[tokio::test]
async fn test_sweep_skips_pinned_and_stops_at_goal() {
    let h = Harness::new().await;
    let paths = hydrated_files(&h).await;
    h.machine.pin(&paths[0]).await.unwrap();
    let manager = ReclaimManager::new(policy(100, 50), h.machine.clone());

    let report = manager.run_sweep().await;

    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.dehydrated_count, 2);
    assert_eq!(report.bytes_freed, 80);
    assert_eq!(report.error_count, 0);
    assert_eq!(h.machine.get_state(&paths[0]).unwrap().state(), EntryState::Hydrated);
    assert_eq!(h.read(&paths[0]).len(), 40);
    assert_eq!(hydrated_usage(&h.machine.snapshot()), 40);
}

#[tokio::test]
async fn test_sweep_never_touches_pinned_even_over_limit() {
    let h = Harness::new().await;
    let paths = hydrated_files(&h).await;
    for path in &paths {
        h.machine.pin(path).await.unwrap();
    }
    let manager = ReclaimManager::new(policy(10, 10), h.machine.clone());

    let report = manager.run_sweep().await;

    assert_eq!(report.dehydrated_count, 0);
    assert_eq!(report.skipped_count, 3);
    assert!(paths
        .iter()
        .all(|p| h.machine.get_state(p).unwrap().state() == EntryState::Hydrated));
}
