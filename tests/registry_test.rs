mod common;

use common::{MockSocketFactory, gateway, settle};
use std::sync::atomic::Ordering;
use std::time::Duration;
use wa_gateway::auth::AuthStateStore;
use wa_gateway::repository::Repository;
use wa_gateway::socket::{AuthCreds, SocketEvent, WireConnection};
use wa_gateway::{GatewayConfig, GatewayError};

fn secret_config() -> GatewayConfig {
    GatewayConfig {
        token_secret: "test-secret".to_string(),
        ..GatewayConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_duplicate_and_invalid_names() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();

    let err = gw.registry.create("shop1").await.unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));

    assert!(gw.registry.create("").await.is_err());
    assert!(gw.registry.create("shop one").await.is_err());
    assert!(gw.registry.create("shop/one").await.is_err());
    assert_eq!(gw.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn load_restores_every_persisted_instance() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    let creds = AuthCreds {
        me: Some("5511999999999@s.whatsapp.net".to_string()),
        keys: serde_json::json!({}),
    };
    gw.auth.write("shop1", &creds).await.unwrap();
    gw.auth.write("shop2", &creds).await.unwrap();

    let started = gw.registry.load().await.unwrap();
    assert_eq!(started, 2);
    assert_eq!(gw.factory.creates(), 2);

    let mut names = gw.registry.names();
    names.sort();
    assert_eq!(names, vec!["shop1", "shop2"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn connected_instances_need_force_to_delete() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();
    gw.factory
        .emit(SocketEvent::ConnectionUpdate {
            connection: Some(WireConnection::Open),
            qr: None,
            status_code: None,
        })
        .await;
    settle().await;

    let err = gw.registry.delete("shop1", false).await.unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));
    assert!(gw.registry.get("shop1").is_ok());

    gw.registry.delete("shop1", true).await.unwrap();
    assert!(gw.registry.get("shop1").is_err());
    // Forced deletion closes without a server-side logout.
    assert_eq!(gw.factory.socket.logout_calls.load(Ordering::SeqCst), 0);
    assert!(gw.factory.socket.end_calls.load(Ordering::SeqCst) >= 1);
    assert!(gw.repository.find_instance("shop1").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_removes_runtime_and_stored_state() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();
    gw.auth
        .write("shop1", &AuthCreds::default())
        .await
        .unwrap();
    gw.factory
        .emit(SocketEvent::ConnectionUpdate {
            connection: Some(WireConnection::Open),
            qr: None,
            status_code: None,
        })
        .await;
    settle().await;

    gw.registry.logout("shop1").await.unwrap();
    settle().await;

    assert_eq!(gw.factory.socket.logout_calls.load(Ordering::SeqCst), 1);
    assert!(gw.registry.get("shop1").is_err());
    assert!(gw.auth.read("shop1").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn hub_tokens_are_scoped_to_known_instances() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();

    let err = gw
        .registry
        .hub_token("ghost", Duration::from_secs(60))
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    let token = gw
        .registry
        .hub_token("shop1", Duration::from_secs(60))
        .unwrap();
    assert_eq!(
        gw.registry.token_keeper().verify(&token).unwrap(),
        "shop1"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_instances_are_evicted_from_memory_only() {
    let config = GatewayConfig {
        idle_eviction: Some(Duration::from_millis(200)),
        ..secret_config()
    };
    let gw = gateway(config, MockSocketFactory::new());
    gw.auth
        .write("shop1", &AuthCreds::default())
        .await
        .unwrap();
    gw.registry.create("shop1").await.unwrap();

    // Never reaches `open`, so the grace period expires.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(gw.registry.get("shop1").is_err());
    // Stored state survives for a later retry.
    assert!(gw.auth.read("shop1").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn connected_instances_survive_the_idle_deadline() {
    let config = GatewayConfig {
        idle_eviction: Some(Duration::from_millis(200)),
        ..secret_config()
    };
    let gw = gateway(config, MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();
    gw.factory
        .emit(SocketEvent::ConnectionUpdate {
            connection: Some(WireConnection::Open),
            qr: None,
            status_code: None,
        })
        .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(gw.registry.get("shop1").is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_strips_ephemeral_artifacts_but_not_pairings() {
    let config = GatewayConfig {
        sweep_interval: Duration::from_millis(200),
        ..secret_config()
    };
    let gw = gateway(config, MockSocketFactory::new());
    gw.auth
        .write("shop1", &AuthCreds::default())
        .await
        .unwrap();
    gw.auth.add_ephemeral("shop1", "session-5511");
    gw.auth.add_ephemeral("shop1", "app-state-sync-key-1");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(gw.auth.ephemeral_count("shop1"), 0);
    assert!(gw.auth.read("shop1").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn creds_updates_flow_into_the_auth_store() {
    let gw = gateway(secret_config(), MockSocketFactory::new());
    gw.registry.create("shop1").await.unwrap();

    gw.factory
        .emit(SocketEvent::CredsUpdate(AuthCreds {
            me: Some("5511999999999@s.whatsapp.net".to_string()),
            keys: serde_json::json!({ "noiseKey": "fresh" }),
        }))
        .await;
    settle().await;

    let stored = gw.auth.read("shop1").await.unwrap().unwrap();
    assert_eq!(stored.me.as_deref(), Some("5511999999999@s.whatsapp.net"));
}
