use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A proxy as handed over by the subscription layer.
///
/// Every descriptor has a local tunnel listener at `base_port + index`,
/// spawned and managed outside this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyDescriptor {
    pub protocol: String,
    pub server: String,
    pub port: u16,
    pub name: String,
    /// Subscription group the descriptor came from
    pub sub_name: String,
    /// User id (vless/vmess)
    pub uuid: String,
    /// Secret (trojan/shadowsocks)
    pub password: String,
    /// Network type: tcp, ws, grpc, ...
    pub network: String,
    pub security: String,
    pub sni: String,
    /// Host header
    pub host: String,
    pub path: String,
    pub short_id: String,
    pub public_key: String,
    /// Config line as received; published by the selector after sanitising
    pub source_line: String,
    /// Zero-based tunnel index
    pub index: u16,
    #[serde(skip)]
    stable_id: OnceLock<String>,
}

impl ProxyDescriptor {
    pub fn new(protocol: &str, server: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            server: server.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Stable identity of this proxy, computed on first use and cached.
    ///
    /// Fields must not be mutated after the first call.
    pub fn stable_id(&self) -> &str {
        self.stable_id.get_or_init(|| stable_identity(self))
    }

    /// `server:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.server.contains(':') && !self.server.starts_with('[') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    /// Whether `other` describes the same live tunnel as `self`.
    pub fn same_as(&self, other: &ProxyDescriptor) -> bool {
        self.stable_id() == other.stable_id()
            && self.index == other.index
            && self.name == other.name
            && self.sub_name == other.sub_name
            && self.source_line == other.source_line
    }
}

impl AsRef<ProxyDescriptor> for ProxyDescriptor {
    fn as_ref(&self) -> &ProxyDescriptor {
        self
    }
}

/// Derive the stable identity from the transport-critical fields.
///
/// Display name, subscription group, source line and tunnel index are
/// deliberately excluded: renaming a node or reordering a subscription must
/// not reset its health history.
pub fn stable_identity(proxy: &ProxyDescriptor) -> String {
    let port = proxy.port.to_string();
    let fields: [&str; 12] = [
        &proxy.protocol,
        &proxy.server,
        &port,
        &proxy.uuid,
        &proxy.password,
        &proxy.network,
        &proxy.security,
        &proxy.sni,
        &proxy.host,
        &proxy.path,
        &proxy.short_id,
        &proxy.public_key,
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Last recorded probe result for one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStatus {
    pub online: bool,
    pub latency: Duration,
}

impl ProxyStatus {
    pub fn online(latency: Duration) -> Self {
        Self {
            online: true,
            latency,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }
}
