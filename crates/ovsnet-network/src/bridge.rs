//! Bridge lifecycle: database rows, kernel link setup, NAT and port attachment
//!
//! A bridge is provisioned as one transaction inserting its internal
//! Interface, Port, Bridge and BridgeOpt rows plus the root row membership.
//! Whether a bridge exists is decided by a Port row with the bridge's name.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ovsnet_core::{Cancellation, RetryPolicy};
use ovsnet_ovsdb::cache::ROOT_TABLE;
use ovsnet_ovsdb::{datum, Condition, DbCache, Mutation, Operation, OvsdbTransport, Row, Transaction};

use crate::error::{from_retry, DriverError, Result};
use crate::firewall::Firewall;
use crate::gateway::{GatewayCoordinator, ServiceType};
use crate::netlink::LinkOps;
use crate::options::{bridge_name, BridgeMode, NetworkState};

/// Service type and network id recorded when the real ones cannot be recovered
pub const SENTINEL: &str = "none";

const BRIDGE_TABLE: &str = "Bridge";
const BRIDGE_OPT_TABLE: &str = "BridgeOpt";
const PORT_TABLE: &str = "Port";
const INTERFACE_TABLE: &str = "Interface";

fn to_row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

/// Interface, Port, Bridge, optional BridgeOpt and the root membership mutation.
fn bridge_transaction(name: &str, bridge_opt: Option<(&str, &str)>, root_uuid: &str) -> Transaction {
    let mut tx = Transaction::new()
        .add(Operation::insert_named(
            INTERFACE_TABLE,
            to_row(json!({"name": name, "type": "internal"})),
            "intf",
        ))
        .add(Operation::insert_named(
            PORT_TABLE,
            to_row(json!({"name": name, "interfaces": datum::named_uuid("intf")})),
            "port",
        ))
        .add(Operation::insert_named(
            BRIDGE_TABLE,
            to_row(json!({"name": name, "stp_enable": false, "ports": datum::named_uuid("port")})),
            "bridge",
        ));

    if let Some((service_type, network_id)) = bridge_opt {
        tx.push(Operation::insert(
            BRIDGE_OPT_TABLE,
            to_row(json!({"name": name, "service_type": service_type, "network_id": network_id})),
        ));
    }

    tx.add(Operation::mutate(
        ROOT_TABLE,
        vec![Condition::uuid_eq(root_uuid)],
        vec![Mutation::insert("bridges", datum::set(vec![datum::named_uuid("bridge")]))],
    ))
}

/// Creates, configures and removes OVS bridges and their ports.
pub struct BridgeManager {
    transport: Arc<dyn OvsdbTransport>,
    cache: DbCache,
    links: Arc<dyn LinkOps>,
    firewall: Arc<dyn Firewall>,
    gateway: Arc<GatewayCoordinator>,
    link_poll: RetryPolicy,
    cancel: Cancellation,
    /// Bridges this process is deleting; the watcher leaves them alone.
    expected_deletions: Mutex<HashSet<String>>,
}

impl BridgeManager {
    pub fn new(
        transport: Arc<dyn OvsdbTransport>,
        cache: DbCache,
        links: Arc<dyn LinkOps>,
        firewall: Arc<dyn Firewall>,
        gateway: Arc<GatewayCoordinator>,
        link_poll: RetryPolicy,
        cancel: Cancellation,
    ) -> Self {
        Self {
            transport,
            cache,
            links,
            firewall,
            gateway,
            link_poll,
            cancel,
            expected_deletions: Mutex::new(HashSet::new()),
        }
    }

    pub fn cache(&self) -> &DbCache {
        &self.cache
    }

    pub fn links(&self) -> &Arc<dyn LinkOps> {
        &self.links
    }

    pub fn gateway(&self) -> &Arc<GatewayCoordinator> {
        &self.gateway
    }

    async fn select_one(&self, table: &str, column: &str, value: &str) -> Result<Option<Row>> {
        let results = Transaction::new()
            .add(Operation::select(table, vec![Condition::eq(column, value)]))
            .commit(self.transport.as_ref())
            .await?;
        Ok(results
            .into_iter()
            .next()
            .and_then(|result| result.rows)
            .and_then(|rows| rows.into_iter().next()))
    }

    /// A port named after the bridge means the bridge is provisioned.
    pub async fn port_exists(&self, name: &str) -> Result<bool> {
        Ok(self.select_one(PORT_TABLE, "name", name).await?.is_some())
    }

    pub async fn bridge_service_type(&self, name: &str) -> Result<Option<String>> {
        let row = self.select_one(BRIDGE_OPT_TABLE, "name", name).await?;
        Ok(row.and_then(|r| datum::row_str(&r, "service_type").map(str::to_string)))
    }

    pub async fn bridge_network_id(&self, name: &str) -> Result<Option<String>> {
        let row = self.select_one(BRIDGE_OPT_TABLE, "name", name).await?;
        Ok(row.and_then(|r| datum::row_str(&r, "network_id").map(str::to_string)))
    }

    pub async fn bridge_name_for_network(&self, network_id: &str) -> Result<Option<String>> {
        let row = self.select_one(BRIDGE_OPT_TABLE, "network_id", network_id).await?;
        Ok(row.and_then(|r| datum::row_str(&r, "name").map(str::to_string)))
    }

    /// Bridge of a network: the BridgeOpt record if there is one, else the derived name.
    pub async fn resolve_bridge_name(&self, network_id: &str) -> String {
        match self.bridge_name_for_network(network_id).await {
            Ok(Some(name)) => name,
            Ok(None) => bridge_name(network_id),
            Err(e) => {
                warn!("BridgeOpt lookup for network {} failed: {}", network_id, e);
                bridge_name(network_id)
            }
        }
    }

    async fn create_bridge_rows(&self, name: &str, bridge_opt: Option<(&str, &str)>) -> Result<()> {
        let root_uuid = self.cache.root_uuid().await.ok_or(DriverError::RootNotCached)?;
        bridge_transaction(name, bridge_opt, &root_uuid)
            .commit(self.transport.as_ref())
            .await?;
        debug!("Inserted OVSDB rows for bridge {}", name);
        Ok(())
    }

    /// Insert the bridge rows unless the bridge already exists.
    pub async fn ensure_bridge(&self, name: &str, service_type: &str, network_id: &str) -> Result<()> {
        if self.port_exists(name).await? {
            info!("Bridge {} already exists, skipping creation", name);
            return Ok(());
        }

        self.create_bridge_rows(name, Some((service_type, network_id))).await?;

        if !self.port_exists(name).await? {
            error!("Bridge {} not found after creation", name);
            return Err(DriverError::BridgeNotCreated(name.to_string()));
        }
        info!("Bridge {} created", name);
        Ok(())
    }

    async fn wait_for_link(&self, name: &str) -> Result<()> {
        let what = format!("link for bridge {}", name);
        self.link_poll
            .poll_until(&self.cancel, &what, || self.links.link_exists(name))
            .await
            .map_err(|e| {
                let err = from_retry(e, |attempts, _| DriverError::LinkNotVisible {
                    name: name.to_string(),
                    attempts,
                });
                error!("{}", err);
                err
            })
    }

    async fn setup_nat(&self, state: &NetworkState) -> Result<()> {
        let name = &state.bridge_name;
        let cidr = state.gateway_cidr();

        // a failed assignment is tolerated, the address may already be there
        match state.gateway_address() {
            Some((address, prefix_len)) => {
                if let Err(e) = self.links.add_address(name, address, prefix_len).await {
                    warn!("Error assigning address {} on bridge {}: {:#}", cidr, name, e);
                }
            }
            None => warn!("Gateway {} is not an IP address, not assigning it", cidr),
        }

        let addresses = self
            .links
            .ipv4_addresses(name)
            .await
            .map_err(|e| DriverError::link("address lookup", name, e))?;
        if addresses.is_empty() {
            error!("No IP address found on bridge {}", name);
            return Err(DriverError::NoIpv4Address(name.to_string()));
        }

        match self.firewall.ensure_masquerade(&cidr).await {
            Ok(true) => info!("Added MASQUERADE rule for {}", cidr),
            Ok(false) => debug!("MASQUERADE rule for {} already present", cidr),
            Err(e) => {
                error!("Could not set NAT rules for bridge {}: {:#}", name, e);
                return Err(DriverError::Firewall {
                    cidr,
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }

    /// Provision the bridge of a network: rows, kernel link, mode setup, link up
    /// and, for gateway networks, the gateway process.
    pub async fn init_bridge(&self, network_id: &str, state: &NetworkState) -> Result<()> {
        let name = &state.bridge_name;
        self.ensure_bridge(name, &state.network_type, network_id).await?;
        self.wait_for_link(name).await?;

        match state.mode {
            BridgeMode::Nat => self.setup_nat(state).await?,
            BridgeMode::Flat => {
                debug!(
                    "Flat bridge {}: bind interface {:?} is left unattached",
                    name, state.bind_interface
                );
            }
        }

        self.links.set_up(name).await.map_err(|e| {
            warn!("Error enabling bridge {}: {:#}", name, e);
            DriverError::link("set up", name, e)
        })?;

        match state.service_type() {
            Some(service_type) => {
                if let Err(e) = self
                    .gateway
                    .start(service_type, &state.network_name, name, &state.bind_interface)
                    .await
                {
                    error!("Failed to start {} gateway for bridge {}: {}", service_type, name, e);
                }
            }
            None => debug!(
                "Network type {:?} of bridge {} runs no gateway",
                state.network_type, name
            ),
        }
        Ok(())
    }

    /// Remove the Bridge and BridgeOpt rows and the root membership, then stop the
    /// gateway process if the bridge hosted one.
    pub async fn delete_bridge(&self, name: &str) -> Result<()> {
        let service_type = match self.bridge_service_type(name).await {
            Ok(Some(service_type)) => service_type,
            Ok(None) => {
                warn!("No BridgeOpt row for bridge {}", name);
                "unknown".to_string()
            }
            Err(e) => {
                warn!("Failed to get service type of bridge {}: {}", name, e);
                "unknown".to_string()
            }
        };

        let bridge_uuid = match self.cache.uuid_by_name(BRIDGE_TABLE, name).await {
            Some(uuid) => uuid,
            None => {
                error!("Unable to find a bridge uuid by name: {}", name);
                return Err(DriverError::BridgeUuidNotCached(name.to_string()));
            }
        };
        let root_uuid = self.cache.root_uuid().await.ok_or(DriverError::RootNotCached)?;

        let tx = Transaction::new()
            .add(Operation::delete(BRIDGE_TABLE, vec![Condition::eq("name", name)]))
            .add(Operation::delete(BRIDGE_OPT_TABLE, vec![Condition::eq("name", name)]))
            .add(Operation::mutate(
                ROOT_TABLE,
                vec![Condition::uuid_eq(&root_uuid)],
                vec![Mutation::delete("bridges", datum::set(vec![datum::uuid(&bridge_uuid)]))],
            ));

        self.expected_deletions.lock().await.insert(name.to_string());
        if let Err(e) = tx.commit(self.transport.as_ref()).await {
            // a lost reply may still have been committed, so the mark stays
            if !e.is_transport() {
                self.expected_deletions.lock().await.remove(name);
            }
            return Err(e.into());
        }
        debug!("OVSDB delete bridge transaction successful");

        if ServiceType::from_tag(&service_type).is_none() {
            info!("Bridge {} has service type {:?}, no gateway to stop", name, service_type);
            return Ok(());
        }
        if let Err(e) = self.gateway.stop().await {
            warn!("Failed to stop gateway of bridge {}: {}", name, e);
        }
        Ok(())
    }

    /// Consume the mark left by [`delete_bridge`](Self::delete_bridge).
    pub(crate) async fn take_expected_deletion(&self, name: &str) -> bool {
        self.expected_deletions.lock().await.remove(name)
    }

    /// Re-insert the database rows of a bridge that disappeared. A surviving
    /// BridgeOpt row is kept as is; otherwise one with sentinel values is added.
    pub async fn restore_bridge_rows(&self, name: &str) -> Result<()> {
        let surviving = match self.select_one(BRIDGE_OPT_TABLE, "name", name).await {
            Ok(row) => row,
            Err(e) => {
                warn!("BridgeOpt lookup for bridge {} failed: {}", name, e);
                None
            }
        };

        match surviving {
            Some(row) => {
                info!(
                    "Restoring bridge {} (service type {:?}, network {:?})",
                    name,
                    datum::row_str(&row, "service_type").unwrap_or_default(),
                    datum::row_str(&row, "network_id").unwrap_or_default()
                );
                self.create_bridge_rows(name, None).await
            }
            None => {
                warn!("Restoring bridge {} without BridgeOpt data", name);
                self.create_bridge_rows(name, Some((SENTINEL, SENTINEL))).await
            }
        }
    }

    /// Attach an existing kernel interface to a bridge as a port.
    pub async fn add_port(&self, bridge: &str, port: &str) -> Result<()> {
        let results = Transaction::new()
            .add(Operation::insert_named(INTERFACE_TABLE, to_row(json!({"name": port})), "intf"))
            .add(Operation::insert_named(
                PORT_TABLE,
                to_row(json!({"name": port, "interfaces": datum::named_uuid("intf")})),
                "port",
            ))
            .add(Operation::mutate(
                BRIDGE_TABLE,
                vec![Condition::eq("name", bridge)],
                vec![Mutation::insert("ports", datum::set(vec![datum::named_uuid("port")]))],
            ))
            .commit(self.transport.as_ref())
            .await?;

        // the unreferenced port rows are garbage collected by the server
        if results.get(2).and_then(|r| r.count) == Some(0) {
            return Err(DriverError::BridgeNotFound(bridge.to_string()));
        }
        info!("Port {} added to bridge {}", port, bridge);
        Ok(())
    }

    pub async fn delete_port(&self, bridge: &str, port: &str) -> Result<()> {
        let port_uuid = self
            .select_one(PORT_TABLE, "name", port)
            .await?
            .and_then(|row| row.get("_uuid").and_then(datum::as_uuid).map(str::to_string))
            .ok_or_else(|| DriverError::PortNotFound(port.to_string()))?;

        Transaction::new()
            .add(Operation::mutate(
                BRIDGE_TABLE,
                vec![Condition::eq("name", bridge)],
                vec![Mutation::delete("ports", datum::set(vec![datum::uuid(&port_uuid)]))],
            ))
            .add(Operation::delete(PORT_TABLE, vec![Condition::eq("name", port)]))
            .add(Operation::delete(INTERFACE_TABLE, vec![Condition::eq("name", port)]))
            .commit(self.transport.as_ref())
            .await?;
        info!("Port {} removed from bridge {}", port, bridge);
        Ok(())
    }

    /// First IPv4 address currently on the bridge interface.
    pub async fn bridge_gateway_ip(&self, name: &str) -> Result<String> {
        let addresses = self
            .links
            .ipv4_addresses(name)
            .await
            .map_err(|e| DriverError::link("address lookup", name, e))?;
        addresses
            .first()
            .map(|a| a.address.to_string())
            .ok_or_else(|| DriverError::NoIpv4Address(name.to_string()))
    }
}
