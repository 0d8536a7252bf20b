//! Network driver state machine
//!
//! A network id is either unknown or provisioned. Create validates options,
//! records a [`NetworkState`] and provisions the bridge, discarding the record
//! again if provisioning fails. Delete, join and leave find the bridge through
//! BridgeOpt or the derived name, never through the in-process record, so they
//! keep working after a driver restart.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeManager;
use crate::error::{DriverError, Result};
use crate::options::{veth_names, NetworkState, CONTAINER_ETH_NAME};
use crate::types::{
    CreateEndpointRequest, CreateNetworkRequest, DeleteNetworkRequest, EndpointRequest,
    InfoResponse, InterfaceName, JoinRequest, JoinResponse,
};

pub struct NetworkDriver {
    bridges: Arc<BridgeManager>,
    networks: RwLock<HashMap<String, NetworkState>>,
}

impl NetworkDriver {
    pub fn new(bridges: Arc<BridgeManager>) -> Self {
        Self {
            bridges,
            networks: RwLock::new(HashMap::new()),
        }
    }

    pub fn bridges(&self) -> &Arc<BridgeManager> {
        &self.bridges
    }

    /// State recorded for a network created by this process.
    pub async fn network(&self, network_id: &str) -> Option<NetworkState> {
        self.networks.read().await.get(network_id).cloned()
    }

    pub async fn create_network(&self, req: &CreateNetworkRequest) -> Result<()> {
        debug!("Create network request for {}", req.network_id);
        let state = NetworkState::from_request(req).map_err(|e| {
            error!("Invalid options for network {}: {}", req.network_id, e);
            e
        })?;

        // gateway networks hold the node-wide lock until their process is started
        let gateway = self.bridges.gateway();
        let _exclusive = match state.service_type() {
            Some(service_type) => {
                let guard = gateway.exclusive().await;
                if let Err(e) = gateway.check_available(service_type, &state.network_name).await {
                    error!("Validation of {} network {} failed: {}", service_type, req.network_id, e);
                    return Err(e);
                }
                Some(guard)
            }
            None => None,
        };

        self.networks
            .write()
            .await
            .insert(req.network_id.clone(), state.clone());

        debug!("Initializing bridge {} for network {}", state.bridge_name, req.network_id);
        if let Err(e) = self.bridges.init_bridge(&req.network_id, &state).await {
            error!("Creating network {} failed: {}", req.network_id, e);
            self.networks.write().await.remove(&req.network_id);
            return Err(e);
        }

        info!(
            "Network {} ready on bridge {} ({} mode, mtu {})",
            req.network_id, state.bridge_name, state.mode, state.mtu
        );
        Ok(())
    }

    pub async fn delete_network(&self, req: &DeleteNetworkRequest) -> Result<()> {
        let bridge = self.bridges.resolve_bridge_name(&req.network_id).await;
        debug!("Deleting bridge {} of network {}", bridge, req.network_id);

        let result = self.bridges.delete_bridge(&bridge).await;
        self.networks.write().await.remove(&req.network_id);
        match &result {
            Ok(()) => info!("Network {} deleted", req.network_id),
            Err(e) => error!("Deleting bridge {} failed: {}", bridge, e),
        }
        result
    }

    pub async fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<()> {
        debug!("Create endpoint {} on network {}", req.endpoint_id, req.network_id);
        Ok(())
    }

    pub async fn delete_endpoint(&self, req: &EndpointRequest) -> Result<()> {
        debug!("Delete endpoint {} on network {}", req.endpoint_id, req.network_id);
        Ok(())
    }

    pub async fn endpoint_info(&self, req: &EndpointRequest) -> Result<InfoResponse> {
        debug!("Endpoint info for {}", req.endpoint_id);
        Ok(InfoResponse::default())
    }

    /// Create the endpoint's veth pair, attach the host end to the bridge and
    /// report the bridge's live gateway address.
    pub async fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        let links = self.bridges.links();
        let (host, peer) = veth_names(&req.endpoint_id);

        links.create_veth(&host, &peer).await.map_err(|e| {
            error!("Failed to create the veth pair {} / {}: {:#}", host, peer, e);
            DriverError::link("create veth", &host, e)
        })?;
        links.set_up(&host).await.map_err(|e| {
            warn!("Error enabling veth local iface {}: {:#}", host, e);
            DriverError::link("set up", &host, e)
        })?;

        let bridge = self.bridges.resolve_bridge_name(&req.network_id).await;
        self.bridges.add_port(&bridge, &host).await.map_err(|e| {
            error!("Error attaching veth {} to bridge {}: {}", host, bridge, e);
            e
        })?;
        info!("Attached veth {} to bridge {}", host, bridge);

        let gateway = self.bridges.bridge_gateway_ip(&bridge).await.map_err(|e| {
            error!("Error getting gateway ip of bridge {}: {}", bridge, e);
            e
        })?;

        debug!("Joined endpoint {} of network {} to {}", req.endpoint_id, req.network_id, req.sandbox_key);
        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: peer,
                dst_prefix: CONTAINER_ETH_NAME.to_string(),
            },
            gateway,
        })
    }

    pub async fn leave(&self, req: &EndpointRequest) -> Result<()> {
        let (host, _) = veth_names(&req.endpoint_id);
        if let Err(e) = self.bridges.links().delete_link(&host).await {
            warn!("Unable to delete veth {} on leave: {:#}", host, e);
        }

        let bridge = self.bridges.resolve_bridge_name(&req.network_id).await;
        self.bridges.delete_port(&bridge, &host).await.map_err(|e| {
            error!("OVS port {} delete failed on bridge {}: {}", host, bridge, e);
            e
        })?;
        info!("Deleted OVS port {} from bridge {}", host, bridge);
        Ok(())
    }
}
