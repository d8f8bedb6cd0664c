//! MQTT topic scheme for operation delivery.
//!
//! Topic structure: `opsync/v1/{tenant}/...`
//!
//! - `devices/{device}/ops`: operations addressed to one device
//! - `ops`: operations for every device of the tenant

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "opsync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme with the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "opsync".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Topic a single device receives operations on.
    #[must_use]
    pub fn device_ops(&self, device: &str) -> String {
        format!("{}/devices/{device}/ops", self.base())
    }

    /// Topic shared by every device of the tenant.
    #[must_use]
    pub fn broadcast_ops(&self) -> String {
        format!("{}/ops", self.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::new("household");

        assert_eq!(
            scheme.device_ops("phone"),
            "opsync/v1/household/devices/phone/ops"
        );
        assert_eq!(scheme.broadcast_ops(), "opsync/v1/household/ops");
    }

    #[test]
    fn tenants_are_isolated() {
        let home = TopicScheme::new("home");
        let office = TopicScheme::new("office");

        assert_ne!(home.broadcast_ops(), office.broadcast_ops());
        assert_ne!(home.device_ops("phone"), office.device_ops("phone"));
    }
}
