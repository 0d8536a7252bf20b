//! NAT rules for bridge subnets

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Firewall rule API used by NAT-mode bridges
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Make sure traffic from `cidr` is masqueraded on POSTROUTING.
    /// Returns true if a rule had to be inserted.
    async fn ensure_masquerade(&self, cidr: &str) -> Result<bool>;
}

/// [`Firewall`] backed by the iptables binary
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Iptables {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn masquerade_args(action: &'static str, cidr: &str) -> Vec<String> {
        [action, "POSTROUTING", "-t", "nat", "-s", cidr, "-j", "MASQUERADE"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl Firewall for Iptables {
    async fn ensure_masquerade(&self, cidr: &str) -> Result<bool> {
        // Rule exists if the check succeeds
        let check = Command::new(&self.binary)
            .args(Self::masquerade_args("-C", cidr))
            .output()
            .await
            .context("Failed to check NAT rule")?;
        if check.status.success() {
            debug!("MASQUERADE rule for {} already exists", cidr);
            return Ok(false);
        }

        let insert = Command::new(&self.binary)
            .args(Self::masquerade_args("-I", cidr))
            .output()
            .await
            .context("Failed to add NAT rule")?;
        if !insert.status.success() {
            return Err(anyhow!(
                "{} -I POSTROUTING failed: {}",
                self.binary,
                String::from_utf8_lossy(&insert.stderr).trim()
            ));
        }
        // iptables prints nothing on success; anything else is a chain error
        let printed = String::from_utf8_lossy(&insert.stdout);
        if !printed.trim().is_empty() {
            return Err(anyhow!("Error in POSTROUTING chain: {}", printed.trim()));
        }

        info!("NAT MASQUERADE rule added for {}", cidr);
        Ok(true)
    }
}
