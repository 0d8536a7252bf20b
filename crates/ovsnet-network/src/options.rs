//! Network options, naming rules and per-network state

use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{DriverError, Result};
use crate::gateway::ServiceType;
use crate::types::{CreateNetworkRequest, IpamData};

pub const BRIDGE_PREFIX: &str = "ovsbr-";
pub const PORT_PREFIX: &str = "ovs-veth0-";
pub const PEER_PREFIX: &str = "ethc";
pub const CONTAINER_ETH_NAME: &str = "eth";

pub const GENERIC_OPTIONS: &str = "com.docker.network.generic";
pub const MTU_OPTION: &str = "linker.net.ovs.bridge.mtu";
pub const MODE_OPTION: &str = "linker.net.ovs.bridge.mode";
pub const BRIDGE_NAME_OPTION: &str = "linker.net.ovs.bridge.name";
pub const BIND_INTERFACE_OPTION: &str = "linker.net.ovs.bridge.bind_interface";
pub const TYPE_OPTION: &str = "linker.net.ovs.bridge.type";
pub const NETWORK_NAME_OPTION: &str = "linker.net.ovs.network.name";

pub const DEFAULT_MTU: u32 = 1500;
pub const MIN_MTU: u32 = 68;

/// Length of the id prefix used in derived names
const ID_PREFIX_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeMode {
    #[default]
    Nat,
    Flat,
}

impl FromStr for BridgeMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nat" => Ok(BridgeMode::Nat),
            "flat" => Ok(BridgeMode::Flat),
            other => Err(DriverError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgeMode::Nat => "nat",
            BridgeMode::Flat => "flat",
        })
    }
}

/// First five characters of a network or endpoint id.
pub fn truncate_id(id: &str) -> &str {
    id.get(..ID_PREFIX_LEN).unwrap_or(id)
}

/// Deterministic bridge name for a network, e.g. `ovsbr-28174`.
pub fn bridge_name(network_id: &str) -> String {
    format!("{}{}", BRIDGE_PREFIX, truncate_id(network_id))
}

/// Host-side and container-side veth names for an endpoint.
pub fn veth_names(endpoint_id: &str) -> (String, String) {
    let suffix = truncate_id(endpoint_id);
    (
        format!("{}{}", PORT_PREFIX, suffix),
        format!("{}{}", PEER_PREFIX, suffix),
    )
}

/// Look `key` up in the generic options map first, then at the top level.
pub fn option_value<'a>(options: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    options
        .get(GENERIC_OPTIONS)
        .and_then(Value::as_object)
        .and_then(|generic| generic.get(key))
        .or_else(|| options.get(key))
}

pub fn option_str<'a>(options: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    option_value(options, key).and_then(Value::as_str)
}

/// MTU given as a JSON number or a numeric string.
pub fn parse_mtu(value: &Value) -> Result<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match parsed {
        Some(mtu) if mtu >= MIN_MTU => Ok(mtu),
        _ => Err(DriverError::InvalidMtu(value_text(value))),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Gateway address and mask from the first IPv6 pool, then the first IPv4 pool.
/// When both carry a gateway the IPv4 one wins.
pub fn gateway_from_ipam(ipv4: &[IpamData], ipv6: &[IpamData]) -> Result<(String, String)> {
    let mut gateway = "";
    if let Some(pool) = ipv6.first() {
        if !pool.gateway.is_empty() {
            gateway = &pool.gateway;
        }
    }
    if let Some(pool) = ipv4.first() {
        if !pool.gateway.is_empty() {
            gateway = &pool.gateway;
        }
    }

    if gateway.is_empty() {
        return Err(DriverError::MissingGateway);
    }
    match gateway.split_once('/') {
        Some((address, mask)) if address.parse::<IpAddr>().is_ok() && mask.parse::<u8>().is_ok() => {
            Ok((address.to_string(), mask.to_string()))
        }
        _ => Err(DriverError::InvalidGateway(gateway.to_string())),
    }
}

/// What the driver remembers about a network it created in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub bridge_name: String,
    pub mtu: u32,
    pub mode: BridgeMode,
    pub gateway: String,
    pub gateway_mask: String,
    pub bind_interface: String,
    /// Raw type option; only `sgw`/`pgw` mean anything.
    pub network_type: String,
    pub network_name: String,
}

impl NetworkState {
    /// Validate and normalise a create request. Nothing is touched on error.
    pub fn from_request(req: &CreateNetworkRequest) -> Result<Self> {
        let options = &req.options;

        let bridge_name = option_str(options, BRIDGE_NAME_OPTION)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| bridge_name(&req.network_id));

        let mtu = match option_value(options, MTU_OPTION) {
            Some(value) => parse_mtu(value)?,
            None => DEFAULT_MTU,
        };

        let mode = match option_value(options, MODE_OPTION) {
            Some(Value::String(mode)) => mode.parse()?,
            Some(other) => return Err(DriverError::InvalidMode(other.to_string())),
            None => BridgeMode::default(),
        };

        let (gateway, gateway_mask) = gateway_from_ipam(&req.ipv4_data, &req.ipv6_data)?;

        Ok(Self {
            bridge_name,
            mtu,
            mode,
            gateway,
            gateway_mask,
            bind_interface: option_str(options, BIND_INTERFACE_OPTION)
                .unwrap_or_default()
                .to_string(),
            network_type: option_str(options, TYPE_OPTION)
                .unwrap_or_default()
                .to_string(),
            network_name: option_str(options, NETWORK_NAME_OPTION)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn service_type(&self) -> Option<ServiceType> {
        ServiceType::from_tag(&self.network_type)
    }

    /// `address/mask` as assigned to the bridge
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.gateway_mask)
    }

    pub fn gateway_address(&self) -> Option<(IpAddr, u8)> {
        Some((self.gateway.parse().ok()?, self.gateway_mask.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NETWORK_ID: &str = "281746a33da5c97b088275925d6dd8b91bd1ba3e7ded0714e2cef47125074e38";

    fn request(options: Value, ipv4_gateway: &str) -> CreateNetworkRequest {
        CreateNetworkRequest {
            network_id: NETWORK_ID.to_string(),
            options: options.as_object().cloned().unwrap_or_default(),
            ipv4_data: vec![IpamData {
                pool: "172.18.0.0/16".into(),
                gateway: ipv4_gateway.into(),
                ..Default::default()
            }],
            ipv6_data: vec![],
        }
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(bridge_name("281746a33da5c97b"), "ovsbr-28174");
        assert_eq!(
            veth_names("9f8a2"),
            ("ovs-veth0-9f8a2".to_string(), "ethc9f8a2".to_string())
        );
        assert_eq!(truncate_id("abc"), "abc");
    }

    #[test]
    fn test_defaults() {
        let state = NetworkState::from_request(&request(json!({}), "172.18.0.1/16")).unwrap();
        assert_eq!(state.bridge_name, "ovsbr-28174");
        assert_eq!(state.mtu, DEFAULT_MTU);
        assert_eq!(state.mode, BridgeMode::Nat);
        assert_eq!(state.gateway, "172.18.0.1");
        assert_eq!(state.gateway_mask, "16");
        assert_eq!(state.gateway_cidr(), "172.18.0.1/16");
        assert_eq!(state.gateway_address(), Some(("172.18.0.1".parse().unwrap(), 16)));
        assert!(state.network_type.is_empty());
        assert!(state.service_type().is_none());
    }

    #[test]
    fn test_overrides_generic_and_top_level() {
        let state = NetworkState::from_request(&request(
            json!({
                "linker.net.ovs.bridge.name": "br-custom",
                "linker.net.ovs.bridge.mtu": "9000",
                GENERIC_OPTIONS: {
                    "linker.net.ovs.bridge.mode": "flat",
                    "linker.net.ovs.network.name": "newovs",
                    "linker.net.ovs.bridge.bind_interface": "eth100",
                    "linker.net.ovs.bridge.type": "SGW"
                }
            }),
            "172.18.0.1/16",
        ))
        .unwrap();
        assert_eq!(state.bridge_name, "br-custom");
        assert_eq!(state.mtu, 9000);
        assert_eq!(state.mode, BridgeMode::Flat);
        assert_eq!(state.bind_interface, "eth100");
        assert_eq!(state.network_name, "newovs");
        assert_eq!(state.service_type(), Some(ServiceType::Sgw));
    }

    #[test]
    fn test_invalid_options() {
        let bad_mode = NetworkState::from_request(&request(json!({MODE_OPTION: "vlan"}), "10.0.0.1/24"));
        assert!(matches!(bad_mode, Err(DriverError::InvalidMode(m)) if m == "vlan"));

        let small_mtu = NetworkState::from_request(&request(json!({MTU_OPTION: 67}), "10.0.0.1/24"));
        assert!(matches!(small_mtu, Err(DriverError::InvalidMtu(_))));
        assert_eq!(parse_mtu(&json!(68)).unwrap(), 68);
        assert!(parse_mtu(&json!("jumbo")).is_err());

        let no_gateway = NetworkState::from_request(&request(json!({}), ""));
        assert!(matches!(no_gateway, Err(DriverError::MissingGateway)));

        let unsplittable = NetworkState::from_request(&request(json!({}), "10.0.0.1"));
        assert!(matches!(unsplittable, Err(DriverError::InvalidGateway(_))));
        let garbage = NetworkState::from_request(&request(json!({}), "gateway/sixteen"));
        assert!(matches!(garbage, Err(DriverError::InvalidGateway(g)) if g == "gateway/sixteen"));
    }

    #[test]
    fn test_ipv4_gateway_overrides_ipv6() {
        let v6 = vec![IpamData {
            gateway: "fd00::1/64".into(),
            ..Default::default()
        }];
        let v4 = vec![IpamData {
            gateway: "10.1.0.1/24".into(),
            ..Default::default()
        }];
        assert_eq!(gateway_from_ipam(&v4, &v6).unwrap(), ("10.1.0.1".into(), "24".into()));
        assert_eq!(gateway_from_ipam(&[], &v6).unwrap(), ("fd00::1".into(), "64".into()));
    }
}
