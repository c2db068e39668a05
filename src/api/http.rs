//! HTTP API
//!
//! Diagnostic endpoints served on the node's own port. `GET /topology` is
//! also what joining nodes bootstrap from.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::connector::{ConnectorHandle, StateName};
use crate::topology::TOPOLOGY_VERSION;

/// State response
#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: Option<StateName>,
    #[serde(rename = "topologyVer")]
    pub topology_ver: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub ready: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the router
pub fn router(connector: ConnectorHandle) -> Router {
    Router::new()
        .route("/topology", get(handle_topology))
        .route("/state", get(handle_state))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(connector)
}

async fn handle_topology(State(connector): State<ConnectorHandle>) -> impl IntoResponse {
    match connector.topology().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

async fn handle_state(State(connector): State<ConnectorHandle>) -> impl IntoResponse {
    Json(StateResponse {
        state: connector.state().name,
        topology_ver: TOPOLOGY_VERSION.to_string(),
    })
}

async fn handle_health(State(connector): State<ConnectorHandle>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: connector.local_node().id().to_string(),
        ready: connector.state().ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WolfMeshConfig;
    use crate::connector::Connector;
    use crate::topology::TopologySnapshot;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn master() -> ConnectorHandle {
        let mut config = WolfMeshConfig::default();
        config.node.bind_address = "127.0.0.1".into();
        config.node.port = 0;
        let handle = Connector::start(config).await.unwrap();
        handle.wait_for_state(StateName::Master).await.unwrap();
        handle
    }

    async fn get_json<T: serde::de::DeserializeOwned>(router: Router, uri: &str) -> (StatusCode, T) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let connector = master().await;
        let (status, body): (_, serde_json::Value) = get_json(router(connector.clone()), "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "state": "master", "topologyVer": TOPOLOGY_VERSION }));
        connector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_endpoint() {
        let connector = master().await;
        let (status, snapshot): (_, TopologySnapshot) = get_json(router(connector.clone()), "/topology").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot.master.as_deref(), Some(connector.local_node().id()));
        assert_eq!(snapshot.nodes.len(), 1);

        let (_, health): (_, HealthResponse) = get_json(router(connector.clone()), "/health").await;
        assert_eq!(health.status, "ok");
        assert!(health.ready);

        connector.stop().await.unwrap();
        let response = router(connector)
            .oneshot(Request::builder().uri("/topology").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
