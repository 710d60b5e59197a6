use anyhow::{Context, Result};
use facegate_core::{EnrollmentService, HmacCredentialIssuer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod extractor;
mod store;

use config::{BusKind, Config};
use dbus_interface::FacegateService;
use extractor::CommandExtractor;
use store::SqliteStore;

const BUS_NAME: &str = "org.freedesktop.Facegate1";
const OBJECT_PATH: &str = "/org/freedesktop/Facegate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load()?;

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "identity store opened");

    let extractor = CommandExtractor::from_command(&config.extractor_command)
        .context("extractor_command is not configured (FACEGATE_EXTRACTOR_COMMAND)")?;
    tracing::info!(program = extractor.program(), "descriptor extractor configured");

    let ttl = config.credential_ttl;
    let issuer = match &config.credential_key {
        Some(key) => HmacCredentialIssuer::from_hex_key(key, ttl)
            .context("credential_key must be 64 hex characters")?,
        None => {
            tracing::warn!("no credential_key configured; credentials will not survive a restart");
            HmacCredentialIssuer::ephemeral(ttl)
        }
    };

    let service = Arc::new(EnrollmentService::new(
        store,
        extractor,
        issuer,
        config.enrollment_settings(),
    ));

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacegateService::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
