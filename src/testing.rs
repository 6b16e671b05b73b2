use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use blob_store::BlobStorageConfig;
use http_body_util::BodyExt;
use tower::ServiceExt;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{ConverterCommand, ServerConfig},
    conversion::JobSnapshot,
    service::Service,
};

pub struct TestService {
    pub service: Service,
    pub router: Router,
    // keeping a reference to the temp dir to ensure it is not deleted
    temp_dir: tempfile::TempDir,
}

/// Converter that writes an upper-cased copy of its input.
pub fn upper_case_converter() -> ConverterCommand {
    shell_converter("tr a-z A-Z < \"$1\" > \"$2\"")
}

pub fn shell_converter(script: &str) -> ConverterCommand {
    ConverterCommand {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "convert".to_string()],
        working_dir: None,
        env: HashMap::new(),
    }
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::new_with_config(|_| {}).await
    }

    pub async fn new_with_config(customize: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let mut cfg = ServerConfig {
            blob_storage: BlobStorageConfig::new(
                temp_dir.path().join("public").to_str().unwrap_or_default(),
            ),
            ..Default::default()
        };
        cfg.conversion.converter = upper_case_converter();
        cfg.conversion.timeout_secs = 10;
        customize(&mut cfg);
        cfg.validate()?;

        let service = Service::new(cfg)?;
        let router = service.router();
        Ok(Self {
            service,
            router,
            temp_dir,
        })
    }

    pub fn root(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("public")
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn wait_for_conversion(&self, key: &str) -> JobSnapshot {
        for _ in 0..500 {
            if let Ok(Some(snapshot)) = self.service.orchestrator.status(key) {
                if snapshot.state.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("conversion for {key} never finished");
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body is not json")
}
