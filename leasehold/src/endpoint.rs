use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ENDPOINT_ADDRESS_MAX: usize = 256;

/// Address a lease agent listens on. Doubles as the identity of a remote lease agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListenEndpoint {
    pub address: String,
    pub port: u16,
}

impl ListenEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.address.is_empty()
            && self.address.len() <= ENDPOINT_ADDRESS_MAX
            && !self.address.contains('\0')
            && self.port != 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidEndpoint {
                endpoint: self.to_string(),
            })
        }
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for ListenEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEndpoint {
            endpoint: s.to_string(),
        };
        let (address, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let endpoint = ListenEndpoint::new(address.trim_start_matches('[').trim_end_matches(']'), port);
        endpoint.validate()?;
        Ok(endpoint)
    }
}
