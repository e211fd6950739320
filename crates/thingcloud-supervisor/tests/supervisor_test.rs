mod common;

use std::sync::atomic::Ordering;

use common::{eventually, start_supervisor};
use thingcloud_common::{CloudError, TenantConfig};

fn shared(id: i64) -> TenantConfig {
    TenantConfig::new(id)
}

fn dedicated(id: i64) -> TenantConfig {
    TenantConfig::new(id).with_developer_key(format!("dev-{}", id))
}

fn total_uses(counts: &[Option<usize>]) -> usize {
    counts.iter().flatten().sum()
}

#[tokio::test]
async fn test_start_spawns_pool_and_running_tenants() {
    let h = start_supervisor(2, vec![shared(1).with_running(true), shared(2), shared(3).with_running(true)]).await;

    assert_eq!(h.supervisor.worker_count(), 2);
    assert_eq!(h.supervisor.running_tenants(), vec![1, 3]);
    // Round-robin placed the two tenants on different workers.
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(1), Some(1)]);
    assert!(!h.supervisor.is_running(2));
}

#[tokio::test]
async fn test_concurrent_starts_host_tenant_once() {
    let h = start_supervisor(2, vec![shared(7)]).await;

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = h.supervisor.clone();
            tokio::spawn(async move { supervisor.start_user(7).await })
        })
        .collect();
    for start in starts {
        start.await.unwrap().unwrap();
    }

    assert!(h.supervisor.is_running(7));
    assert_eq!(total_uses(&h.supervisor.shared_use_counts()), 1);
}

#[tokio::test]
async fn test_lifecycle_ops_apply_in_arrival_order() {
    let h = start_supervisor(1, vec![shared(1), shared(2)]).await;

    // The default test runtime is single threaded, so spawned tasks reach
    // the tenant lock in spawn order.
    let sequence = |tenant, ops: Vec<&'static str>| {
        let supervisor = h.supervisor.clone();
        ops.into_iter()
            .map(move |op| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    match op {
                        "start" => supervisor.start_user(tenant).await,
                        "kill" => supervisor.kill_user(tenant).await,
                        _ => supervisor.restart_user(tenant).await,
                    }
                })
            })
            .collect::<Vec<_>>()
    };

    let mut tasks = sequence(1, vec!["start", "kill", "restart", "kill", "start"]);
    tasks.extend(sequence(2, vec!["start", "restart", "kill"]));
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(h.supervisor.is_running(1));
    assert!(!h.supervisor.is_running(2));
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(1)]);
}

#[tokio::test]
async fn test_kill_user_is_idempotent() {
    let h = start_supervisor(1, vec![shared(1), dedicated(2)]).await;

    h.supervisor.kill_user(1).await.unwrap();
    h.supervisor.kill_user(99).await.unwrap();

    h.supervisor.start_user(1).await.unwrap();
    h.supervisor.start_user(2).await.unwrap();
    assert_eq!(h.supervisor.worker_count(), 2);

    for _ in 0..2 {
        h.supervisor.kill_user(1).await.unwrap();
        h.supervisor.kill_user(2).await.unwrap();
    }
    assert!(!h.supervisor.is_running(1));
    assert!(!h.supervisor.is_running(2));
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(0)]);
    assert_eq!(h.supervisor.worker_count(), 1);
    assert_eq!(h.launcher.hard_kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_tenant_is_rejected() {
    let h = start_supervisor(1, vec![]).await;
    let err = h.supervisor.start_user(5).await.unwrap_err();
    assert!(matches!(err, CloudError::UnknownTenant(5)));
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(0)]);
}

#[tokio::test]
async fn test_developer_tenant_gets_own_process() {
    let h = start_supervisor(1, vec![dedicated(4), shared(5)]).await;

    h.supervisor.start_user(4).await.unwrap();
    h.supervisor.start_user(5).await.unwrap();
    assert_eq!(h.supervisor.get_process_id(4).unwrap().as_str(), "tenant-4");
    assert_eq!(h.supervisor.get_process_id(5).unwrap().as_str(), "shared-0");
    assert_eq!(h.supervisor.get_process_id(6), None);
    assert_eq!(h.supervisor.worker_count(), 2);
}

#[tokio::test]
async fn test_restart_without_cache_rereads_config() {
    let h = start_supervisor(1, vec![dedicated(3)]).await;
    h.supervisor.start_user(3).await.unwrap();

    let cache = h.root.path().join("3").join("cache");
    std::fs::write(cache.join("stale"), b"x").unwrap();

    h.tenants.update(3, |config| config.developer_key = None);
    h.supervisor.restart_user_without_cache(3).await.unwrap();

    assert!(!cache.join("stale").exists());
    assert_eq!(h.supervisor.get_process_id(3).unwrap().as_str(), "shared-0");
    assert_eq!(h.supervisor.worker_count(), 1);
}

#[tokio::test]
async fn test_clear_cache_and_delete_user() {
    let h = start_supervisor(1, vec![shared(8)]).await;

    // Missing directories are fine.
    h.supervisor.clear_cache(8).await.unwrap();

    h.supervisor.start_user(8).await.unwrap();
    let dir = h.root.path().join("8");
    assert!(dir.join("cache").is_dir());

    h.supervisor.clear_cache(8).await.unwrap();
    assert!(!dir.join("cache").exists());
    assert!(h.supervisor.is_running(8));

    h.supervisor.delete_user(8).await.unwrap();
    assert!(!dir.exists());
    assert!(!h.supervisor.is_running(8));
}

#[tokio::test]
async fn test_shared_crash_restarts_and_reattaches() {
    let h = start_supervisor(1, vec![shared(1), shared(2)]).await;
    h.supervisor.start_user(1).await.unwrap();
    h.supervisor.start_user(2).await.unwrap();
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(2)]);

    h.launcher.handle("shared-0").crash();
    eventually(|| !h.supervisor.is_running(1)).await;

    eventually(|| h.supervisor.is_running(1) && h.supervisor.is_running(2)).await;
    assert_eq!(h.supervisor.get_process_id(1).unwrap().as_str(), "shared-1");
    assert_eq!(h.supervisor.get_process_id(2).unwrap().as_str(), "shared-1");
    assert_eq!(h.supervisor.shared_use_counts(), vec![Some(2)]);
    assert_eq!(h.launcher.hard_kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_killed_tenant_is_not_restarted_after_crash() {
    let h = start_supervisor(1, vec![shared(1), shared(2)]).await;
    h.supervisor.start_user(1).await.unwrap();
    h.supervisor.start_user(2).await.unwrap();

    h.launcher.handle("shared-0").crash();
    eventually(|| !h.supervisor.is_running(1)).await;
    h.supervisor.kill_user(2).await.unwrap();

    eventually(|| h.supervisor.is_running(1)).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!h.supervisor.is_running(2));
}

#[tokio::test]
async fn test_dedicated_crash_is_not_restarted() {
    let h = start_supervisor(1, vec![dedicated(6)]).await;
    h.supervisor.start_user(6).await.unwrap();
    assert_eq!(h.supervisor.worker_count(), 2);

    h.launcher.handle("tenant-6").crash();
    eventually(|| !h.supervisor.is_running(6)).await;
    eventually(|| h.supervisor.worker_count() == 1).await;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!h.supervisor.is_running(6));
    assert_eq!(h.launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_stubborn_dedicated_worker_is_killed_once() {
    let h = start_supervisor(1, vec![dedicated(9)]).await;
    h.launcher.make_stubborn(9);
    h.supervisor.start_user(9).await.unwrap();

    h.supervisor.kill_user(9).await.unwrap();

    assert_eq!(h.launcher.hard_kills.load(Ordering::SeqCst), 1);
    assert!(!h.supervisor.is_running(9));
    eventually(|| h.supervisor.worker_count() == 1).await;

    // Give the monitor's own timer a chance to misfire.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(h.launcher.hard_kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_all_users_stops_everything() {
    let h = start_supervisor(2, vec![shared(1), shared(2), dedicated(3)]).await;
    for tenant in 1..=3 {
        h.supervisor.start_user(tenant).await.unwrap();
    }
    assert_eq!(h.supervisor.worker_count(), 3);

    h.supervisor.kill_all_users().await.unwrap();
    assert_eq!(h.supervisor.worker_count(), 0);
    assert!(h.supervisor.running_tenants().is_empty());
    assert!(h.supervisor.is_shutting_down());

    // No replacement is spawned after a shutdown.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(h.launcher.launch_count(), 3);
    assert!(h.supervisor.start_user(1).await.is_err());

    // Engines were closed cleanly and saved their preferences.
    assert!(h.root.path().join("3").join("prefs.json").exists());
}

#[tokio::test]
async fn test_kill_all_users_preempts_start_in_progress() {
    // Interrupt the start at different points of its way to the worker.
    for yields in 0..8 {
        let h = start_supervisor(1, vec![dedicated(3)]).await;
        let start = {
            let supervisor = h.supervisor.clone();
            tokio::spawn(async move { supervisor.start_user(3).await })
        };
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }

        h.supervisor.kill_all_users().await.unwrap();
        assert!(!h.supervisor.is_running(3), "tenant survived shutdown after {} yields", yields);
        assert_eq!(h.supervisor.worker_count(), 0);
        assert!(h.launcher.all_exited(), "worker alive after shutdown ({} yields)", yields);

        // A start that had not begun yet is refused outright.
        let launches = h.launcher.launch_count();
        let _ = start.await.unwrap();
        assert!(!h.supervisor.is_running(3));
        assert_eq!(h.supervisor.worker_count(), 0);
        assert_eq!(h.launcher.launch_count(), launches);
    }
}
