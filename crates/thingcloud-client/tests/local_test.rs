//! Front end against real supervisors running in-process workers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use thingcloud_client::{ClientConfig, ClientEvent, EngineManager, LocalEngineManager};
use thingcloud_common::auth::AuthConfig;
use thingcloud_common::{CloudError, TenantConfig};
use thingcloud_supervisor::{ControlListener, InProcessLauncher, MemoryTenantStore, ProcessSupervisor, SupervisorConfig};
use thingcloud_worker::BasicEngineFactory;

const TOKEN: &str = "front-end-token";

struct Shard {
    supervisor: ProcessSupervisor,
    addr: String,
    _root: TempDir,
}

async fn start_shard(shard_id: usize, addr: &str, tenants: Vec<TenantConfig>) -> Shard {
    let root = tempfile::tempdir().unwrap();
    let config = SupervisorConfig::new(root.path())
        .with_shard_id(shard_id)
        .with_shared_processes(1)
        .with_auth(AuthConfig::with_token(TOKEN))
        .with_restart_delay(Duration::from_millis(50))
        .with_kill_timeout(Duration::from_millis(500));
    let supervisor = ProcessSupervisor::new(
        config,
        Arc::new(InProcessLauncher::new(Arc::new(BasicEngineFactory))),
        Arc::new(MemoryTenantStore::with_tenants(tenants)),
    );
    supervisor.start().await.unwrap();

    let listener = ControlListener::bind(addr, supervisor.clone(), AuthConfig::with_token(TOKEN), Duration::from_secs(5))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(listener.run());
    Shard {
        supervisor,
        addr,
        _root: root,
    }
}

fn client_config(shards: &[&Shard]) -> ClientConfig {
    ClientConfig::new(shards.iter().map(|s| s.addr.clone()).collect())
        .with_auth_token(TOKEN)
        .with_reconnect_delay(Duration::from_millis(50))
}

fn tenants() -> Vec<TenantConfig> {
    (1..=4).map(TenantConfig::new).collect()
}

#[tokio::test]
async fn test_lifecycle_is_routed_by_shard() {
    let even = start_shard(0, "127.0.0.1:0", tenants()).await;
    let odd = start_shard(1, "127.0.0.1:0", tenants()).await;
    let manager = LocalEngineManager::new(client_config(&[&even, &odd])).unwrap();
    manager.start().await.unwrap();
    assert!(manager.is_connected(0));
    assert!(manager.is_connected(1));

    manager.start_user(1).await.unwrap();
    manager.start_user(2).await.unwrap();
    assert!(odd.supervisor.is_running(1));
    assert!(!even.supervisor.is_running(1));
    assert!(even.supervisor.is_running(2));

    assert!(manager.is_running(1).await.unwrap());
    assert_eq!(manager.get_process_id(2).await.unwrap().as_deref(), Some("shared-0"));

    manager.kill_all_users().await.unwrap();
    assert!(odd.supervisor.running_tenants().is_empty());
    assert!(even.supervisor.running_tenants().is_empty());
    assert!(!manager.is_running(1).await.unwrap());

    manager.stop().await;
}

#[tokio::test]
async fn test_get_engine_is_memoized() {
    let shard = start_shard(0, "127.0.0.1:0", tenants()).await;
    let manager = LocalEngineManager::new(client_config(&[&shard])).unwrap();
    manager.start().await.unwrap();
    manager.start_user(3).await.unwrap();

    let (first, second) = tokio::join!(manager.get_engine(3), manager.get_engine(3));
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.channel().same_channel(second.channel()));

    let info = first.engine().call("getInfo", vec![]).await.unwrap();
    assert_eq!(info["id"], json!(3));
    let pong = first.websocket().call("ping", vec![]).await.unwrap();
    assert_eq!(pong, json!("pong"));

    let again = manager.get_engine(3).await.unwrap();
    assert!(again.channel().same_channel(first.channel()));

    manager.stop().await;
}

#[tokio::test]
async fn test_kill_closes_engine_socket() {
    let shard = start_shard(0, "127.0.0.1:0", tenants()).await;
    let manager = LocalEngineManager::new(client_config(&[&shard])).unwrap();
    manager.start().await.unwrap();
    let mut events = manager.subscribe();

    manager.start_user(4).await.unwrap();
    let engine = manager.get_engine(4).await.unwrap();
    manager.kill_user(4).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ClientEvent::SocketClosed(4));
    assert!(engine.is_closed());

    let err = manager.get_engine(4).await.unwrap_err();
    assert_eq!(err.code(), "ENOENT");

    // A fresh start hands out a fresh connection.
    manager.start_user(4).await.unwrap();
    let fresh = manager.get_engine(4).await.unwrap();
    assert!(!fresh.channel().same_channel(engine.channel()));

    manager.stop().await;
}

#[tokio::test]
async fn test_reconnects_once_shard_comes_up() {
    // Reserve a port, then free it so the shard starts out unreachable.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap().to_string();
    drop(reserved);

    let config = ClientConfig::new(vec![addr.clone()])
        .with_auth_token(TOKEN)
        .with_reconnect_delay(Duration::from_millis(50));
    let manager = LocalEngineManager::new(config).unwrap();
    manager.start().await.unwrap();

    assert!(matches!(manager.start_user(1).await, Err(CloudError::SupervisorUnreachable(0))));
    assert!(matches!(manager.kill_all_users().await, Err(CloudError::SupervisorUnreachable(0))));

    let shard = start_shard(0, &addr, tenants()).await;
    let mut connected = false;
    for _ in 0..100 {
        if manager.is_connected(0) {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(connected, "manager never reconnected");

    manager.start_user(1).await.unwrap();
    assert!(shard.supervisor.is_running(1));

    manager.stop().await;
    assert!(!manager.is_connected(0));
}

#[tokio::test]
async fn test_wrong_token_never_connects() {
    let shard = start_shard(0, "127.0.0.1:0", tenants()).await;
    let config = ClientConfig::new(vec![shard.addr.clone()]).with_auth_token("not-the-token");
    let manager = LocalEngineManager::new(config).unwrap();
    manager.start().await.unwrap();
    assert!(!manager.is_connected(0));
    manager.stop().await;
}
