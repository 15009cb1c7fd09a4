//! Radio access preconditions checked before any session starts

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

/// Grants or refuses access to the radio
#[async_trait]
pub trait PermissionGate: Send + Sync + 'static {
    /// Ok when sessions may start; the error text explains what is missing
    async fn check(&self) -> Result<()>;
}

/// Requires a present, powered BlueZ adapter
pub struct BluezPermissions;

#[async_trait]
impl PermissionGate for BluezPermissions {
    async fn check(&self) -> Result<()> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => bail!("BlueZ unavailable: {}", e),
        };
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => bail!("no Bluetooth adapter: {}", e),
        };
        if !adapter.is_powered().await? {
            bail!("adapter {} is powered off", adapter.name());
        }
        debug!("[BT] Adapter {} ready", adapter.name());
        Ok(())
    }
}

/// Gate for simulation and tests
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}
