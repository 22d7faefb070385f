//! Service composition: wires the store, auth, executor and HTTP surface,
//! starts the listener, and handles shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::auth::{AuthService, SessionCache};
use crate::config::Config;
use crate::executor::{self, Executor};
use crate::jobs::JobStore;
use crate::store::Store;
use crate::version::VersionInfo;

pub struct Service {
    cfg: Config,
    auth: Arc<AuthService>,
    job_store: JobStore,
    executor: Arc<dyn Executor>,
}

impl Service {
    pub async fn new(cfg: Config) -> anyhow::Result<Self> {
        cfg.is_valid()?;

        let version = VersionInfo::current();
        tracing::info!(
            build_version = %version.build_version,
            build_hash = %version.build_hash,
            build_date = %version.build_date,
            "starting up"
        );

        let store = Store::new(&cfg.store.data_source).context("failed to create store")?;
        tracing::info!(data_source = %cfg.store.data_source, "initiated data store");

        let session_cache = Arc::new(SessionCache::new(&cfg.api.security.session_cache));
        let auth = Arc::new(AuthService::new(store.clone(), session_cache));
        tracing::info!("initiated auth service");

        let executor = executor::new_executor(&cfg.jobs)
            .await
            .context("failed to create job service")?;
        tracing::info!(api_type = %cfg.jobs.api_type, "initiated job service");

        Ok(Self {
            cfg,
            auth,
            job_store: JobStore::new(store),
            executor,
        })
    }

    pub fn router(&self) -> axum::Router {
        api::router(AppState {
            security: self.cfg.api.security.clone(),
            image_registry: self.cfg.jobs.image_registry.clone(),
            auth: self.auth.clone(),
            job_store: self.job_store.clone(),
            executor: self.executor.clone(),
        })
    }

    /// Serve until the shutdown token fires, then drain in-flight requests
    /// and release executor resources.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = parse_listen_addr(&self.cfg.api.http.listen_address)?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let tls = self.cfg.api.http.tls.clone();
        if tls.enable {
            let rustls_cfg = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_file,
                &tls.key_file,
            )
            .await
            .context("failed to load TLS credentials")?;

            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(30)));
                });
            }

            tracing::info!(%addr, "listening (tls)");
            axum_server::bind_rustls(addr, rustls_cfg)
                .handle(handle)
                .serve(app)
                .await
                .context("api server failed")?;
        } else {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!(%addr, "listening");

            let shutdown = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("api server failed")?;
        }

        tracing::info!("shutting down");

        if let Err(e) = self.executor.shutdown().await {
            tracing::error!(error = %e, "failed to shutdown executor");
        }

        Ok(())
    }
}

fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    addr.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}
