//! Long-running daemon: queue workers plus the admin API

use crate::models::ServerSettings;
use crate::workflow::RemediationService;
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

/// Remediation daemon
pub struct WardenServer {
    host: String,
    port: u16,
    service: Arc<RemediationService>,
}

impl WardenServer {
    pub fn new(settings: &ServerSettings, service: Arc<RemediationService>) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            service,
        }
    }

    /// Resolve the configured host, which may be an IP literal or a name such as `localhost`
    pub async fn address(&self) -> Result<SocketAddr> {
        let mut addresses = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))?;

        addresses
            .next()
            .ok_or_else(|| anyhow!("Server host {} resolved to no addresses", self.host))
    }

    /// Run until Ctrl+C, then stop accepting HTTP requests and drain the queue
    pub async fn start(self) -> Result<()> {
        let address = self.address().await?;

        self.service.start();

        let routes = crate::server::api::create_api_routes(Arc::clone(&self.service));
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(address, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            })
            .with_context(|| format!("Failed to bind to {}", address))?;

        println!("warden admin API listening on http://{}", bound);
        println!("Press Ctrl+C to stop the server");
        tracing::info!(address = %bound, "Admin API started");

        server.await;

        println!("Shutting down; draining queued requests...");
        self.service.shutdown().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str, dir: &tempfile::TempDir) -> WardenServer {
        let settings = ServerSettings {
            host: host.to_string(),
            port: 8790,
        };
        let config = crate::models::Configuration {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let workflow = crate::workflow::RemediationWorkflow::from_configuration(
            &config,
            Arc::new(crate::execution::CommandExecutor::from_settings(&config.executor)),
            crate::audit::AuditSigner::generate(),
        )
        .unwrap();
        let service = Arc::new(RemediationService::from_configuration(
            &config,
            Arc::new(workflow),
        ));

        WardenServer::new(&settings, service)
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(server("not an address", &dir).address().await.is_err());
    }

    #[tokio::test]
    async fn test_host_names_and_literals_resolve() {
        let dir = tempfile::tempdir().unwrap();

        let address = server("localhost", &dir).address().await.unwrap();
        assert!(address.ip().is_loopback());
        assert_eq!(address.port(), 8790);

        let address = server("127.0.0.1", &dir).address().await.unwrap();
        assert_eq!(address, "127.0.0.1:8790".parse::<SocketAddr>().unwrap());
    }
}
