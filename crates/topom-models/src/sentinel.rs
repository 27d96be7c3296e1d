use serde::{Deserialize, Serialize};

/// The set of sentinels watching this product's group masters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sentinel {
    pub servers: Vec<String>,
    /// Sticky until the next successful resync of sentinels and proxies.
    pub out_of_resync: bool,
}
