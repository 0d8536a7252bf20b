//! Companion gateway process coordination
//!
//! At most one gateway process (sgw or pgw) runs per node. It is managed as a
//! systemd unit whose `ExecStart` is the gateway script bound to one bridge.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::exec::run_shell;

/// Gateway flavours a bridge can host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Sgw,
    Pgw,
}

impl ServiceType {
    /// Case-insensitive match on `sgw`/`pgw`; anything else is a plain network.
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag.eq_ignore_ascii_case("sgw") {
            Some(ServiceType::Sgw)
        } else if tag.eq_ignore_ascii_case("pgw") {
            Some(ServiceType::Pgw)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Sgw => "sgw",
            ServiceType::Pgw => "pgw",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS service API for the gateway process
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Is a gateway process already running on this node?
    async fn gateway_running(&self) -> Result<bool>;

    /// Install and start a long-running service for `command`.
    async fn start_gateway(&self, command: &str) -> Result<()>;

    /// Stop the service and remove its definition.
    async fn stop_gateway(&self) -> Result<()>;
}

/// Render the unit file for `command`.
pub fn render_unit(command: &str) -> String {
    format!(
        "[Unit]\nDescription=Linker pgateway or sgateway process\n[Service]\nExecStart={}\n[Install]\nWantedBy=multi-user.target\n",
        command
    )
}

/// `<script> <type> <network-name> <bridge> <bind-interface>`
pub fn gateway_command(
    script: &str,
    service_type: ServiceType,
    network_name: &str,
    bridge: &str,
    bind_interface: &str,
) -> String {
    format!(
        "{} {} {} {} {}",
        script, service_type, network_name, bridge, bind_interface
    )
    .trim_end()
    .to_string()
}

/// [`ServiceManager`] using systemctl and a unit file
#[derive(Debug, Clone)]
pub struct SystemdServices {
    unit_path: PathBuf,
    script: String,
}

impl SystemdServices {
    pub fn new(unit_path: impl Into<PathBuf>, script: &str) -> Self {
        Self {
            unit_path: unit_path.into(),
            script: script.to_string(),
        }
    }

    pub fn unit_path(&self) -> &Path {
        &self.unit_path
    }

    fn unit_name(&self) -> String {
        self.unit_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "linkerGateway.service".to_string())
    }

    async fn systemctl(&self, action: &str, unit: Option<&str>) -> Result<()> {
        info!("Systemd: {} {}", action, unit.unwrap_or(""));
        let mut cmd = Command::new("systemctl");
        cmd.arg(action);
        if let Some(unit) = unit {
            cmd.arg(unit);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "systemctl {} {} failed: {}",
                action,
                unit.unwrap_or(""),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdServices {
    async fn gateway_running(&self) -> Result<bool> {
        let command = format!("ps -ef | grep {} | grep -v grep | wc -l", self.script);
        let output = run_shell(&command).await?;
        let count: u32 = output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("Unexpected process count {:?}", output.stdout))?;
        debug!("{} gateway processes running", count);
        Ok(count > 0)
    }

    async fn start_gateway(&self, command: &str) -> Result<()> {
        tokio::fs::write(&self.unit_path, render_unit(command))
            .await
            .with_context(|| format!("Failed to write {}", self.unit_path.display()))?;

        let unit = self.unit_name();
        self.systemctl("daemon-reload", None).await?;
        self.systemctl("start", Some(&unit)).await?;
        if let Err(e) = self.systemctl("enable", Some(&unit)).await {
            warn!("Failed to enable {}: {:#}", unit, e);
        }
        Ok(())
    }

    async fn stop_gateway(&self) -> Result<()> {
        let unit = self.unit_name();
        info!("Stopping and removing {}", unit);
        self.systemctl("stop", Some(&unit)).await?;
        if let Err(e) = self.systemctl("disable", Some(&unit)).await {
            warn!("Failed to disable {}: {:#}", unit, e);
        }
        tokio::fs::remove_file(&self.unit_path)
            .await
            .with_context(|| format!("Failed to remove {}", self.unit_path.display()))?;
        Ok(())
    }
}

/// Keeps the node-wide single gateway invariant.
pub struct GatewayCoordinator {
    services: Arc<dyn ServiceManager>,
    script: String,
    exclusive: Mutex<()>,
}

impl GatewayCoordinator {
    pub fn new(services: Arc<dyn ServiceManager>, script: &str) -> Self {
        Self {
            services,
            script: script.to_string(),
            exclusive: Mutex::new(()),
        }
    }

    /// Serialises gateway network creation. Hold the guard from the precondition
    /// check until the gateway process is started.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.exclusive.lock().await
    }

    /// Precondition for creating a gateway-type network.
    pub async fn check_available(&self, service_type: ServiceType, network_name: &str) -> Result<(), DriverError> {
        if network_name.is_empty() {
            return Err(DriverError::MissingNetworkName(service_type.to_string()));
        }
        match self.services.gateway_running().await {
            Ok(false) => Ok(()),
            Ok(true) => Err(DriverError::GatewayAlreadyRunning),
            Err(e) => Err(DriverError::service("process check", e)),
        }
    }

    pub async fn start(
        &self,
        service_type: ServiceType,
        network_name: &str,
        bridge: &str,
        bind_interface: &str,
    ) -> Result<(), DriverError> {
        let command = gateway_command(&self.script, service_type, network_name, bridge, bind_interface);
        info!("Starting {} gateway for bridge {}: {}", service_type, bridge, command);
        self.services
            .start_gateway(&command)
            .await
            .map_err(|e| DriverError::service("start", e))
    }

    /// Stop the gateway process. Waits for any gateway create holding
    /// [`exclusive`](Self::exclusive), so that create never sees a half-stopped process.
    pub async fn stop(&self) -> Result<(), DriverError> {
        let _exclusive = self.exclusive.lock().await;
        self.services
            .stop_gateway()
            .await
            .map_err(|e| DriverError::service("stop", e))
    }
}
