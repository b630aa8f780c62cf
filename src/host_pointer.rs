use serde::{Deserialize, Serialize};
use std::fmt;

/// Network endpoint of the certificate manager server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HostPointer {
    host_address: String,
    host_port: u16,
}

impl HostPointer {
    pub fn new(host_address: impl Into<String>, host_port: u16) -> Self {
        Self {
            host_address: host_address.into(),
            host_port,
        }
    }

    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }
}

impl fmt::Display for HostPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_address, self.host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let host = HostPointer::new("127.0.0.1", 36451);
        assert_eq!(host.to_string(), "127.0.0.1:36451");
        assert_eq!(host.host_address(), "127.0.0.1");
        assert_eq!(host.host_port(), 36451);
    }
}
