use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use tunnel_mitm::mitm::tls_config::{load_pem_certs, TlsConfigBuilder};
use tunnel_mitm::{CertificateAuthority, MitmProxy, ProxyConfig, RootSigner};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    info!(version = tunnel_mitm::VERSION, "Starting CONNECT interception proxy");

    // Load configuration
    let config = ProxyConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        mode = ?config.policy.mode,
        tls_verification = ?config.policy.tls_verification,
        "Configuration loaded"
    );

    // Root CA
    let signer = RootSigner::from_pem_files(&config.ca_cert_path, &config.ca_key_path)
        .with_context(|| format!("Failed to load CA from {}", config.ca_cert_path))?;
    let ca = Arc::new(CertificateAuthority::new(
        Arc::new(signer),
        config.ca_config(),
    ));

    // Destination leg TLS
    let mut tls = TlsConfigBuilder::new().verification(config.policy.tls_verification);
    if let Some(path) = &config.extra_roots_path {
        let roots = load_pem_certs(path)
            .with_context(|| format!("Invalid MITM_EXTRA_ROOTS {}", path))?;
        info!(path = %path, count = roots.len(), "Extra upstream roots loaded");
        tls = tls.extra_roots(roots);
    }
    let upstream_tls = Arc::new(
        tls.build_upstream()
            .context("Failed to build upstream TLS configuration")?,
    );

    let proxy = Arc::new(
        MitmProxy::builder(ca)
            .policy(config.policy.build_policy())
            .upstream_tls(upstream_tls)
            .settings(config.session_settings())
            .build()
            .context("Failed to build proxy")?,
    );

    // Bind TCP listener
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    proxy.serve_with_shutdown(listener, shutdown_signal()).await?;

    info!("Proxy stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
