//! Remote network driver HTTP API
//!
//! Every call is a POST with a JSON body. The daemon sends bodies with its own
//! plugin media type, so bodies are decoded from raw bytes whatever the
//! Content-Type says. Failures are answered as `{"Err": "<message>"}`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use ovsnet_network::types::{
    ActivateResponse, CapabilitiesResponse, CreateEndpointRequest, CreateNetworkRequest,
    DeleteNetworkRequest, EndpointRequest, ErrorResponse, InfoResponse, JoinRequest, JoinResponse,
};
use ovsnet_network::{DriverError, ErrorCategory, NetworkDriver};

pub fn router(driver: Arc<NetworkDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(acknowledge))
        .route("/NetworkDriver.DiscoverDelete", post(acknowledge))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(acknowledge))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(acknowledge))
        .with_state(driver)
}

/// An error answered in the plugin protocol's error shape
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<DriverError> for ApiError {
    fn from(e: DriverError) -> Self {
        let status = match e.category() {
            ErrorCategory::Configuration => StatusCode::BAD_REQUEST,
            ErrorCategory::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Transport | ErrorCategory::Consistency => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { err: self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Decode a request body; an empty body is the request type's default.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("Invalid request body: {}", e),
    })
}

async fn activate() -> Json<ActivateResponse> {
    debug!("Plugin activated");
    Json(ActivateResponse::default())
}

async fn capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse::default())
}

async fn create_network(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<Value> {
    let req: CreateNetworkRequest = decode(&body)?;
    driver.create_network(&req).await?;
    Ok(Json(json!({})))
}

async fn delete_network(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<Value> {
    let req: DeleteNetworkRequest = decode(&body)?;
    driver.delete_network(&req).await?;
    Ok(Json(json!({})))
}

async fn create_endpoint(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<Value> {
    let req: CreateEndpointRequest = decode(&body)?;
    driver.create_endpoint(&req).await?;
    Ok(Json(json!({})))
}

async fn delete_endpoint(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<Value> {
    let req: EndpointRequest = decode(&body)?;
    driver.delete_endpoint(&req).await?;
    Ok(Json(json!({})))
}

async fn endpoint_info(
    State(driver): State<Arc<NetworkDriver>>,
    body: Bytes,
) -> ApiResult<InfoResponse> {
    let req: EndpointRequest = decode(&body)?;
    Ok(Json(driver.endpoint_info(&req).await?))
}

async fn join(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<JoinResponse> {
    let req: JoinRequest = decode(&body)?;
    Ok(Json(driver.join(&req).await?))
}

async fn leave(State(driver): State<Arc<NetworkDriver>>, body: Bytes) -> ApiResult<Value> {
    let req: EndpointRequest = decode(&body)?;
    driver.leave(&req).await?;
    Ok(Json(json!({})))
}

/// Discovery and external connectivity need no work from this driver.
async fn acknowledge() -> Json<Value> {
    Json(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ovsnet_network::testing::TestNode;
    use tower::ServiceExt;

    const NETWORK_ID: &str = "281746a33da5c97b088275925d6dd8b91bd1ba3e7ded0714e2cef47125074e38";
    const ENDPOINT_ID: &str = "9f8a2c6b31d0e5f74a1b";

    async fn setup() -> (TestNode, Router) {
        let node = TestNode::start().await;
        let driver = Arc::new(NetworkDriver::new(node.bridges.clone()));
        (node, router(driver))
    }

    async fn call(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/vnd.docker.plugins.v1.2+json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn create_body(options: Value) -> Value {
        json!({
            "NetworkID": NETWORK_ID,
            "Options": options,
            "IPv4Data": [{"AddressSpace": "LocalDefault", "Pool": "172.18.0.0/16", "Gateway": "172.18.0.1/16"}],
            "IPv6Data": []
        })
    }

    #[tokio::test]
    async fn test_handshake() {
        let (_node, app) = setup().await;

        let (status, body) = call(&app, "/Plugin.Activate", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"Implements": ["NetworkDriver"]}));

        let (_, body) = call(&app, "/NetworkDriver.GetCapabilities", json!({})).await;
        assert_eq!(body, json!({"Scope": "local"}));
    }

    #[tokio::test]
    async fn test_empty_body_is_accepted() {
        let (_node, app) = setup().await;
        let request = Request::builder()
            .method("POST")
            .uri("/NetworkDriver.DiscoverNew")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_network_lifecycle() {
        let (node, app) = setup().await;
        node.links.add_link("ovsbr-28174");

        let (status, body) = call(&app, "/NetworkDriver.CreateNetwork", create_body(json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body, json!({}));
        assert!(node.db.row_by_name("Bridge", "ovsbr-28174").is_some());
        node.settle().await;

        let endpoint = json!({"NetworkID": NETWORK_ID, "EndpointID": ENDPOINT_ID});
        let (status, _) = call(&app, "/NetworkDriver.CreateEndpoint", endpoint.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let join = json!({
            "NetworkID": NETWORK_ID,
            "EndpointID": ENDPOINT_ID,
            "SandboxKey": "/var/run/docker/netns/1a2b3c",
            "Options": null
        });
        let (status, body) = call(&app, "/NetworkDriver.Join", join).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["InterfaceName"]["SrcName"], "ethc9f8a2");
        assert_eq!(body["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(body["Gateway"], "172.18.0.1");
        node.settle().await;

        let (status, body) = call(&app, "/NetworkDriver.Leave", endpoint.clone()).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(node.db.row_by_name("Port", "ovs-veth0-9f8a2").is_none());

        let (status, _) = call(&app, "/NetworkDriver.DeleteEndpoint", endpoint).await;
        assert_eq!(status, StatusCode::OK);
        node.settle().await;

        let (status, body) =
            call(&app, "/NetworkDriver.DeleteNetwork", json!({"NetworkID": NETWORK_ID})).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(node.db.row_by_name("Bridge", "ovsbr-28174").is_none());
    }

    #[tokio::test]
    async fn test_invalid_options_answer_err() {
        let (node, app) = setup().await;
        let (status, body) = call(
            &app,
            "/NetworkDriver.CreateNetwork",
            create_body(json!({"linker.net.ovs.bridge.mtu": "12"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["Err"].as_str().unwrap().contains("MTU"));
        assert!(node.db.write_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_answers_err() {
        let (_node, app) = setup().await;
        let request = Request::builder()
            .method("POST")
            .uri("/NetworkDriver.Join")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["Err"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn test_second_gateway_network_rejected() {
        let (node, app) = setup().await;
        node.services.set_running(true);
        let options = json!({
            "com.docker.network.generic": {
                "linker.net.ovs.bridge.type": "pgw",
                "linker.net.ovs.network.name": "core"
            }
        });
        let (status, body) = call(&app, "/NetworkDriver.CreateNetwork", create_body(options)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["Err"].as_str().unwrap().contains("already running"));
    }

    #[tokio::test]
    async fn test_join_on_missing_bridge_is_an_error() {
        let (_node, app) = setup().await;
        let join = json!({"NetworkID": NETWORK_ID, "EndpointID": ENDPOINT_ID, "SandboxKey": ""});
        let (status, body) = call(&app, "/NetworkDriver.Join", join).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["Err"].is_string());
    }
}
