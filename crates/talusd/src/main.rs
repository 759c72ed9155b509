//! talusd — DTLS-over-UDP front-end daemon.
//!
//! Runs the transport with the null-encryption development provider and a
//! demo request handler, plus a localhost JSON status endpoint. Point a
//! real DTLS provider at [`talus_transport::DtlsTransport`] for anything
//! beyond local development.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;

use talus_core::config::TalusConfig;
use talus_transport::insecure::{InsecureServerProtocol, PskTable};
use talus_transport::{DtlsTransport, RequestContext, RequestHandler, TransportOptions};

mod status;

/// Demo handler: greets `/hello` with the authenticated PSK identity,
/// echoes everything else back.
struct HelloHandler;

#[async_trait::async_trait]
impl RequestHandler for HelloHandler {
    async fn process_request(&self, context: RequestContext, payload: Bytes) {
        let request = String::from_utf8_lossy(&payload);
        let response = if request.trim_end() == "/hello" {
            let who = context
                .connection_info()
                .and_then(|info| info.get("psk_identity").cloned())
                .unwrap_or_else(|| "anonymous".to_string());
            format!("Hello {who}!")
        } else {
            request.into_owned()
        };
        if let Err(e) = context.reply(response.as_bytes()).await {
            tracing::warn!(peer = %context.remote_endpoint(), error = %e, "reply failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match TalusConfig::write_default_if_missing() {
        Ok(path) => tracing::info!(path = %path.display(), "using config"),
        Err(e) => tracing::warn!(error = %e, "could not write default config, using built-ins"),
    }
    let config = TalusConfig::load().context("failed to load config")?;

    let mut psk = PskTable::new();
    for (identity, key) in &config.psk.identities {
        psk.insert(identity.clone(), key.as_bytes().to_vec());
    }
    if psk.is_empty() {
        tracing::warn!("no PSK identities configured, every handshake will be rejected");
    }

    let protocol = Arc::new(InsecureServerProtocol::new(psk));
    let options = TransportOptions::from(&config);
    let transport = Arc::new(
        DtlsTransport::bind(options, protocol, Arc::new(HelloHandler))
            .await
            .context("failed to bind transport")?,
    );
    tracing::info!(endpoint = %transport.local_endpoint(), "talusd listening");

    let status_task = if config.status.enabled {
        let transport = transport.clone();
        let port = config.status.port;
        Some(tokio::spawn(async move {
            if let Err(e) = status::serve(transport, port).await {
                tracing::error!(error = %e, "status endpoint failed");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    transport.unbind().await;
    if let Some(task) = status_task {
        task.abort();
    }
    Ok(())
}
