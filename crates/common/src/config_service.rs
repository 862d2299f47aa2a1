//! Node config requests
//!
//! A node identifies itself by its WireGuard public key and receives its
//! effective configuration, registering it on first contact. The reply is
//! the JSON document, a newline, then the signature of both.

use crate::allocation::AddressPlan;
use crate::crypto::Signer;
use crate::metrics::RequestMetrics;
use crate::store::NodeStore;
use crate::types::{ConcentratorRecord, NodeRecord, PublicKey};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Smallest IPv6 path MTU that still carries a full tunnel packet
pub const MIN_V6_MTU: u16 = 1455;

/// Name resolution used to pin concentrator endpoints to addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Addresses for `host`, IPv4 only when `ipv4_only` is set
    async fn resolve(&self, host: &str, ipv4_only: bool) -> Result<Vec<IpAddr>>;
}

/// System resolver via `tokio::net::lookup_host`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioResolver;

#[async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, ipv4_only: bool) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::Resolve(format!("{host}: {e}")))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if (ipv4_only && !ip.is_ipv4()) || ips.contains(&ip) {
                continue;
            }
            ips.push(ip);
        }
        Ok(ips)
    }
}

/// Parameters of a config request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    /// WireGuard public key, standard base64
    pub pubkey: String,
    /// Client chosen value echoed back to bind the signature to this request
    pub nonce: String,
    /// Path MTU the node measured over IPv6
    pub v6mtu: Option<u16>,
    /// Address the request came from, as reported by the fronting proxy
    pub client_addr: Option<String>,
}

/// Configuration document returned to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concentrators: Vec<ConcentratorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wg_keepalive: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address6: Option<String>,
    pub nonce: String,
    /// Unix seconds when the response was built
    pub time: i64,
}

impl ConfigResponse {
    fn new(node: NodeRecord, concentrators: Vec<ConcentratorRecord>, nonce: String) -> Self {
        Self {
            id: node.id,
            concentrators,
            mtu: node.mtu,
            retry: node.retry,
            wg_keepalive: node.wg_keepalive,
            range4: node.range4,
            range6: node.range6,
            address4: node.address4,
            address6: node.address6,
            nonce,
            time: chrono::Utc::now().timestamp(),
        }
    }
}

/// Answers config requests against the node store
pub struct ConfigService {
    store: NodeStore,
    plan: AddressPlan,
    signer: Arc<dyn Signer>,
    resolver: Arc<dyn Resolver>,
    metrics: Arc<RequestMetrics>,
}

impl ConfigService {
    pub fn new(
        store: NodeStore,
        plan: AddressPlan,
        signer: Arc<dyn Signer>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            store,
            plan,
            signer,
            resolver,
            metrics: Arc::new(RequestMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<RequestMetrics> {
        self.metrics.clone()
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Build, serialize and sign the response to `request`.
    ///
    /// The outcome is counted in [`RequestMetrics`] either way.
    pub async fn handle(&self, request: &ConfigRequest) -> Result<String> {
        match self.signed_response(request).await {
            Ok(body) => {
                self.metrics.request_successful();
                Ok(body)
            }
            Err(e) => {
                error!("Error while handling configuration request: {}", e);
                self.metrics.request_failed();
                Err(e)
            }
        }
    }

    async fn signed_response(&self, request: &ConfigRequest) -> Result<String> {
        let response = self.build_response(request).await?;

        let mut body = serde_json::to_string(&response)?;
        body.push('\n');
        let signature = self.signer.sign(body.as_bytes())?;
        body.push_str(&signature);
        Ok(body)
    }

    /// The effective configuration for the requesting node, registering the
    /// node first if it is unknown
    pub async fn build_response(&self, request: &ConfigRequest) -> Result<ConfigResponse> {
        let v6mtu = request
            .v6mtu
            .ok_or_else(|| Error::InvalidRequest("Missing v6mtu query parameter".to_string()))?;
        if request.pubkey.is_empty() {
            return Err(Error::InvalidRequest("Missing pubkey query parameter".to_string()));
        }
        if request.nonce.is_empty() {
            return Err(Error::InvalidRequest("Missing nonce query parameter".to_string()));
        }
        let key = PublicKey::from_base64(&request.pubkey).map_err(|e| {
            Error::InvalidRequest(format!("Couldn't decode pubkey {:?}: {}", request.pubkey, e))
        })?;
        let store_key = key.to_store_key();

        let mut force_ipv4 = !request
            .client_addr
            .as_deref()
            .is_some_and(|addr| addr.contains(':'));
        if v6mtu < MIN_V6_MTU {
            warn!("v6mtu {} too small for {}, using IPv4", v6mtu, key);
            force_ipv4 = true;
        }

        let node = self.load_or_register(&store_key).await?;

        let mut concentrators = Vec::new();
        for mut concentrator in node.enabled_concentrators()? {
            let Some((host, port)) = split_host_port(&concentrator.endpoint) else {
                warn!(
                    "Couldn't split concentrator endpoint {:?} into host and port",
                    concentrator.endpoint
                );
                continue;
            };

            let ips = self.resolver.resolve(host, force_ipv4).await?;
            let Some(ip) = ips.first() else {
                debug!("No addresses for concentrator {}, skipping", concentrator.id);
                continue;
            };
            concentrator.endpoint = join_host_port(*ip, port);
            concentrators.push(concentrator);
        }

        Ok(ConfigResponse::new(node, concentrators, request.nonce.clone()))
    }

    async fn load_or_register(&self, store_key: &str) -> Result<NodeRecord> {
        let default = self.store.get_default().await?;

        let node = match self.store.get_only(store_key).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                let plan = self.plan;
                let id = self
                    .store
                    .create_node(store_key, |draft| plan.fill(draft))
                    .await?;
                info!("Registered node {} with id {}", store_key, id);
                self.store.get_only(store_key).await?
            }
            Err(e) => return Err(e),
        };

        Ok(node.with_defaults(&default))
    }
}

/// Split `host:port` or `[v6]:port`
fn split_host_port(endpoint: &str) -> Option<(&str, &str)> {
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = endpoint.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

fn join_host_port(ip: IpAddr, port: &str) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}
