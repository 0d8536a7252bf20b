//! Request and response bodies of the remote network driver protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One address pool handed over by IPAM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamData {
    pub address_space: String,
    pub pool: String,
    pub gateway: String,
    #[serde(deserialize_with = "null_as_default")]
    pub aux_addresses: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "Options", deserialize_with = "null_as_default")]
    pub options: Map<String, Value>,
    #[serde(rename = "IPv4Data", deserialize_with = "null_as_default")]
    pub ipv4_data: Vec<IpamData>,
    #[serde(rename = "IPv6Data", deserialize_with = "null_as_default")]
    pub ipv6_data: Vec<IpamData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointInterface {
    pub address: String,
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "Interface")]
    pub interface: Option<EndpointInterface>,
    #[serde(rename = "Options", deserialize_with = "null_as_default")]
    pub options: Map<String, Value>,
}

/// Network and endpoint ids; used by DeleteEndpoint, EndpointOperInfo and Leave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "SandboxKey")]
    pub sandbox_key: String,
    #[serde(rename = "Options", deserialize_with = "null_as_default")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    pub value: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: String,
}

impl Default for CapabilitiesResponse {
    fn default() -> Self {
        Self {
            scope: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec!["NetworkDriver".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_network_request() {
        let req: CreateNetworkRequest = serde_json::from_value(json!({
            "NetworkID": "281746a33da5c97b088275925d6dd8b91bd1ba3e7ded0714e2cef47125074e38",
            "Options": {
                "com.docker.network.enable_ipv6": false,
                "com.docker.network.generic": {
                    "linker.net.ovs.network.name": "newovs",
                    "linker.net.ovs.bridge.bind_interface": "eth100",
                    "linker.net.ovs.bridge.type": "sgw"
                }
            },
            "IPv4Data": [{"AddressSpace": "LocalDefault", "Pool": "172.18.0.0/16", "Gateway": "172.18.0.1/16"}],
            "IPv6Data": null
        }))
        .unwrap();
        assert_eq!(req.ipv4_data[0].gateway, "172.18.0.1/16");
        assert!(req.ipv6_data.is_empty());
        assert!(req.options.contains_key("com.docker.network.generic"));
    }

    #[test]
    fn test_join_response_shape() {
        let resp = JoinResponse {
            interface_name: InterfaceName {
                src_name: "ethc9f8a2".into(),
                dst_prefix: "eth".into(),
            },
            gateway: "172.18.0.1".into(),
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"InterfaceName": {"SrcName": "ethc9f8a2", "DstPrefix": "eth"}, "Gateway": "172.18.0.1"})
        );
    }

    #[test]
    fn test_defaults() {
        assert_eq!(serde_json::to_value(CapabilitiesResponse::default()).unwrap(), json!({"Scope": "local"}));
        assert_eq!(
            serde_json::to_value(ActivateResponse::default()).unwrap(),
            json!({"Implements": ["NetworkDriver"]})
        );
        let empty: EndpointRequest = serde_json::from_value(json!({})).unwrap();
        assert!(empty.endpoint_id.is_empty());
    }
}
