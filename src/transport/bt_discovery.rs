//! Bluetooth device discovery: bonded devices and timed scans

use anyhow::Result;
use bluer::{Adapter, Address, Device};
use pillbox_shared::{link, DeviceIdentity, DeviceRegistry, DeviceSource};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone)]
pub struct BtDiscoveryConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
    /// Device name fragment to match (case-insensitive)
    pub name_pattern: Option<String>,
}

impl Default for BtDiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_millis(link::SCAN_PERIOD_MS),
            name_pattern: Some(link::LEGACY_NAME_PATTERN.into()),
        }
    }
}

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub identity: DeviceIdentity,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

/// Bluetooth device discovery service
pub struct BtDiscovery {
    config: BtDiscoveryConfig,
    scanning: AtomicBool,
    cancel: Notify,
}

impl BtDiscovery {
    /// Create a new discovery service
    pub fn new(config: BtDiscoveryConfig) -> Self {
        Self {
            config,
            scanning: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    /// Get the default Bluetooth adapter
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Stop a running scan early; no-op otherwise
    pub async fn cancel(&self) {
        if self.is_scanning() {
            info!("[BT] Cancelling discovery");
            self.cancel.notify_waiters();
        }
    }

    /// Devices bonded with the adapter
    pub async fn paired_devices(&self, adapter: &Adapter) -> Result<Vec<DeviceIdentity>> {
        let mut devices = Vec::new();
        for addr in adapter.device_addresses().await? {
            let device = adapter.device(addr)?;
            if device.is_paired().await.unwrap_or(false) {
                devices.push(identity_of(&device, addr).await);
            }
        }
        Ok(devices)
    }

    /// Scan for devices matching the name pattern, strongest signal first.
    /// Ends after the scan period or on [`BtDiscovery::cancel`].
    pub async fn scan(&self, adapter: &Adapter) -> Result<Vec<ScannedDevice>> {
        let mut found = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let scan = async {
            use futures::StreamExt;
            while let Some(evt) = discover.next().await {
                if let bluer::AdapterEvent::DeviceAdded(addr) = evt {
                    if !seen.insert(addr) {
                        continue;
                    }

                    if let Ok(device) = adapter.device(addr) {
                        let identity = identity_of(&device, addr).await;
                        if self.matches(&identity) {
                            debug!("[BT] Found {}", identity);
                            found.push(ScannedDevice {
                                identity,
                                rssi: device.rssi().await.ok().flatten(),
                            });
                        }
                    }
                }
            }
        };
        self.run_scan(scan).await;

        found.sort_by(|a, b| {
            let rssi_a = a.rssi.unwrap_or(i16::MIN);
            let rssi_b = b.rssi.unwrap_or(i16::MIN);
            rssi_b.cmp(&rssi_a)
        });

        Ok(found)
    }

    /// Fill the registry with bonded devices followed by scan results
    pub async fn refresh_registry(
        &self,
        adapter: &Adapter,
        registry: &mut DeviceRegistry,
        with_scan: bool,
    ) -> Result<()> {
        registry.clear();
        for identity in self.paired_devices(adapter).await? {
            registry.insert(identity, DeviceSource::Bonded);
        }
        info!("[BT] Found {} paired devices", registry.len());

        if with_scan {
            for scanned in self.scan(adapter).await? {
                registry.insert(scanned.identity, DeviceSource::Scanned);
            }
        }
        Ok(())
    }

    /// Drive `scan` until the scan period ends or [`BtDiscovery::cancel`]
    /// is called. Returns true when cancelled.
    pub(super) async fn run_scan<F: Future<Output = ()>>(&self, scan: F) -> bool {
        // Registered before the flag is raised so no cancel slips through
        let cancelled = self.cancel.notified();
        self.scanning.store(true, Ordering::SeqCst);
        info!("[BT] Starting scan ({:?})", self.config.scan_duration);

        let was_cancelled = tokio::select! {
            result = timeout(self.config.scan_duration, scan) => {
                // Timeout is expected, not an error
                if result.is_err() {
                    info!("[BT] Scan timeout");
                }
                false
            }
            _ = cancelled => {
                info!("[BT] Scan cancelled");
                true
            }
        };
        self.scanning.store(false, Ordering::SeqCst);
        was_cancelled
    }

    fn matches(&self, identity: &DeviceIdentity) -> bool {
        match &self.config.name_pattern {
            Some(pattern) => identity.name_matches(pattern),
            None => true,
        }
    }
}

async fn identity_of(device: &Device, addr: Address) -> DeviceIdentity {
    DeviceIdentity::new(addr.to_string(), device.name().await.ok().flatten())
}
