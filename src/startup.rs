use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use sqlx::SqlitePool;
use tracing::info;

use crate::{
    App,
    configuration::{Settings, TlsSettings},
    driver::libvirt::LibvirtConnector,
    events::EventBus,
    handlers,
    pool::ConnectionPool,
    service::HostService,
    subscriptions::SubscriptionManager,
};

pub async fn run(
    settings: Settings,
    db_pool: SqlitePool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let pool = Arc::new(ConnectionPool::new(Arc::new(LibvirtConnector)));
    let bus = Arc::new(EventBus::new());
    let subscriptions = SubscriptionManager::new(Arc::clone(&pool), Arc::clone(&bus));
    let service = HostService::new(db_pool, pool, bus, subscriptions);

    // Reconnect stored hosts without holding up the listener.
    let startup_service = Arc::clone(&service);
    tokio::spawn(async move {
        startup_service.connect_stored_hosts().await;
    });

    let app = handlers::app(App::new(service));

    let address: SocketAddr = format!(
        "{}:{}",
        settings.application.host, settings.application.port
    )
    .parse()?;
    let tls = tls_config(&settings.tls).await?;

    info!(%address, "starting HTTPS server");
    axum_server::bind_rustls(address, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Loads the local certificate pair, generating a self-signed one on first
/// run so development works out of the box.
async fn tls_config(
    settings: &TlsSettings,
) -> Result<RustlsConfig, Box<dyn std::error::Error + Send + Sync>> {
    if !Path::new(&settings.certificate).exists() || !Path::new(&settings.private_key).exists() {
        info!(
            certificate = %settings.certificate,
            "TLS material missing, generating a self-signed certificate"
        );
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        tokio::fs::write(&settings.certificate, generated.cert.pem()).await?;
        tokio::fs::write(&settings.private_key, generated.key_pair.serialize_pem()).await?;
    }

    Ok(RustlsConfig::from_pem_file(&settings.certificate, &settings.private_key).await?)
}
