//! Shared helpers for the end-to-end tests: a gateway bound to ephemeral
//! ports plus a few misbehaving upstreams built on raw TCP listeners.

#![allow(dead_code)]

use biblioteca_gateway::core::config::{GatewayConfig, RouteDefinition, UpstreamConfig};
use biblioteca_gateway::observability::HealthTracker;
use biblioteca_gateway::{Gateway, GatewayResult, GatewayServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration bound to ephemeral loopback ports with probing disabled
pub fn base_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.server.admin_bind_address = "127.0.0.1:0".to_string();
    config.health_check.enabled = false;
    config
}

pub fn add_group(config: &mut GatewayConfig, name: &str, endpoints: Vec<String>) {
    config
        .upstreams
        .insert(name.to_string(), UpstreamConfig { endpoints });
}

pub fn route(pattern: &str, upstream: &str) -> RouteDefinition {
    RouteDefinition {
        pattern: pattern.to_string(),
        upstream: upstream.to_string(),
        strip_prefix: false,
        upstream_prefix: None,
        error_message: None,
    }
}

/// A running gateway
pub struct TestGateway {
    pub proxy: SocketAddr,
    pub admin: SocketAddr,
    pub tracker: Arc<HealthTracker>,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
    handle: JoinHandle<GatewayResult<()>>,
}

impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        let gateway = Gateway::from_config(config).expect("valid config");
        let tracker = Arc::clone(gateway.tracker());
        let server = GatewayServer::bind(gateway).await.expect("bind");
        let proxy = server.local_addr().unwrap();
        let admin = server.admin_local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap();

        Self {
            proxy,
            admin,
            tracker,
            client,
            shutdown,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.proxy, path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin, path)
    }

    pub async fn upstream_status(&self) -> serde_json::Value {
        self.client
            .get(self.admin_url("/admin/upstreams"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Status entry of one instance by id
    pub async fn instance_status(&self, id: &str) -> serde_json::Value {
        let status = self.upstream_status().await;
        status
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|group| group["instances"].as_array().unwrap().clone())
            .find(|instance| instance["id"] == id)
            .unwrap_or_else(|| panic!("instance {} not listed", id))
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("gateway stops in time")
            .expect("gateway task");
        assert!(result.is_ok());
    }
}

/// Address nobody listens on
pub async fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Accepts connections and reads the request but never answers
pub async fn hanging_endpoint(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// Sends response headers promising 100 bytes, then closes after a few
pub async fn truncating_endpoint(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            hits.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

/// Sends response headers promising 100 bytes, a few of them, then goes quiet
pub async fn stalling_endpoint(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await;
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
