//! Registrations made through a server backed by the embedded database
//! survive a full server restart.

use std::sync::Arc;
use std::time::Duration;

use svcreg_core::backend::PersistentBackend;
use svcreg_core::client::RegistryClient;
use svcreg_core::server::RegistryServer;
use svcreg_core::settings::ServerSettings;
use svcreg_core::transport::TransportConfig;

#[tokio::test]
async fn test_registrations_survive_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("registry.redb");

    let settings = ServerSettings {
        cleanup_interval: 60,
        ..ServerSettings::default()
    };

    let service_id;
    {
        let context = Arc::new(zmq::Context::new());
        let server = RegistryServer::new(
            Arc::clone(&context),
            TransportConfig::inproc("persist-req-a"),
            TransportConfig::inproc("persist-pub-a"),
            Arc::new(PersistentBackend::open(&db_path).unwrap()),
            settings.clone(),
        );
        let mut handle = server.start().await.unwrap();

        let client = RegistryClient::new(
            Arc::clone(&context),
            &TransportConfig::inproc("persist-req-a"),
            2000,
        );
        service_id = client
            .register("storage-cs", "10.0.0.7", 7100, Some("storage"), Some(600))
            .await
            .unwrap();
        client.close().await;
        handle.stop().await;
    }

    // Fresh context, fresh server, same database file.
    let context = Arc::new(zmq::Context::new());
    let server = RegistryServer::new(
        Arc::clone(&context),
        TransportConfig::inproc("persist-req-b"),
        TransportConfig::inproc("persist-pub-b"),
        Arc::new(PersistentBackend::open(&db_path).unwrap()),
        settings,
    );
    let mut handle = server.start().await.unwrap();

    let client = RegistryClient::new(
        Arc::clone(&context),
        &TransportConfig::inproc("persist-req-b"),
        2000,
    );
    let fetched = tokio::time::timeout(
        Duration::from_secs(5),
        client.get_service(&service_id),
    )
    .await
    .unwrap()
    .unwrap()
    .expect("record survives restart");
    assert_eq!(fetched.name, "storage-cs");
    assert_eq!(fetched.port, 7100);

    let listed = client.list_services(Some("storage")).await.unwrap();
    assert_eq!(listed.len(), 1);

    client.close().await;
    handle.stop().await;
}
