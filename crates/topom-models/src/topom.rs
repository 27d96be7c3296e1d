use serde::{Deserialize, Serialize};

/// The controller identity written into the leader lock cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topom {
    pub token: String,
    pub start_time: String,
    pub admin_addr: String,
    pub product_name: String,
    pub pid: u32,
    pub pwd: String,
    pub sys: String,
}
