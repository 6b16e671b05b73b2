use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::{BlobStorage, ByteStore};
use tokio::signal;
use tracing::info;

use crate::{
    auth::{AllowAll, Authorizer, RuleAuthorizer},
    config::ServerConfig,
    conversion::ConversionOrchestrator,
    gateway::StorageGateway,
    middleware::InstanceRequestSpan,
    routes::{create_routes, RouteState},
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Service {
    pub config: ServerConfig,
    pub gateway: Arc<StorageGateway>,
    pub orchestrator: ConversionOrchestrator,
    instance_id: String,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let blob_storage = BlobStorage::new(config.blob_storage.clone())
            .context("failed to initialize blob storage")?;
        let store: Arc<dyn ByteStore> = Arc::new(blob_storage);

        let orchestrator = ConversionOrchestrator::new(&config.conversion, store.clone());
        let authorizer: Arc<dyn Authorizer> = if config.authorization.rules.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(RuleAuthorizer::new(&config.authorization))
        };
        let gateway = Arc::new(
            StorageGateway::new(store, authorizer).with_write_hook(Arc::new(orchestrator.clone())),
        );
        let instance_id = config.instance_id();

        Ok(Self {
            config,
            gateway,
            orchestrator,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn router(&self) -> Router {
        let route_state = RouteState {
            gateway: self.gateway.clone(),
            orchestrator: self.orchestrator.clone(),
            route_prefix: self.config.route_prefix.clone(),
        };
        create_routes(
            route_state,
            self.config.max_body_bytes,
            InstanceRequestSpan::new(&self.config.env, &self.instance_id),
        )
    }

    pub async fn start(&self) -> Result<()> {
        metrics::init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval,
            &self.instance_id,
            env!("CARGO_PKG_VERSION"),
        )?;

        let handle = Handle::new();
        tokio::spawn(shutdown_signal(handle.clone()));

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(
            route_prefix = %self.config.route_prefix,
            storage = %self.config.blob_storage.path,
            "server api listening on {}",
            self.config.listen_addr
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await?;

        self.orchestrator.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
    info!("signal received, shutting down server gracefully");
}
