//! Address resolution seam.
//!
//! Discovery and pairing happen outside this crate; the channel only needs to turn a
//! device name pattern into something it can dial, and to know which local address
//! the board listens on.
use log::debug;

use crate::config::LinkConfig;
use crate::protocol::LinkError;

pub trait AddressResolver: Send + Sync {
    /// Address of the first known peer whose name contains `device_name` (case-insensitive).
    fn resolve_peer(&self, device_name: &str) -> Result<String, LinkError>;

    /// Address this side binds to when listening.
    fn local_address(&self) -> Result<String, LinkError>;
}

/// Resolver over a fixed table of already-paired devices.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    paired: Vec<(String, String)>,
    local: String,
}

impl StaticResolver {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            paired: Vec::new(),
            local: local.into(),
        }
    }

    pub fn with_peer(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.paired.push((name.into(), address.into()));
        self
    }

    pub fn from_config(link: &LinkConfig) -> Self {
        Self::new(link.listen_address.clone())
            .with_peer(link.device_name.clone(), link.board_address.clone())
    }
}

impl AddressResolver for StaticResolver {
    fn resolve_peer(&self, device_name: &str) -> Result<String, LinkError> {
        let wanted = device_name.to_uppercase();
        let found = self
            .paired
            .iter()
            .find(|(name, _)| name.to_uppercase().contains(&wanted))
            .map(|(_, address)| address.clone());
        match found {
            Some(address) => {
                debug!("resolved '{}' to {}", device_name, address);
                Ok(address)
            }
            None => Err(LinkError::Resolve(format!(
                "no paired device matching '{}'",
                device_name
            ))),
        }
    }

    fn local_address(&self) -> Result<String, LinkError> {
        Ok(self.local.clone())
    }
}
