//! Registered proxies.

use serde::{Deserialize, Serialize};

/// Identity document of a proxy, as returned by its `/api/model`
/// endpoint and persisted under `proxy/proxy-NNNN`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proxy {
    /// Assigned by the controller at registration.
    pub id: u32,
    /// Random hex token chosen by the proxy; primary key.
    pub token: String,
    pub start_time: String,
    pub admin_addr: String,
    pub proto_type: String,
    pub proxy_addr: String,
    pub product_name: String,
    pub pid: u32,
    pub pwd: String,
    pub sys: String,
}
