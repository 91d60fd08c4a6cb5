#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod application;
pub mod arbitration;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod lease;
pub mod maintenance;
pub mod message;
mod protocol;
pub mod relationship;
pub mod remote;
pub mod tcp;
pub mod time;
pub mod timer;
pub mod transport;
pub mod ttl;

pub mod test_utils;

pub use agent::LeaseAgent;
pub use application::{ArbitrationRequest, EventRegistration, LeaseEvent};
pub use arbitration::ArbitrationResult;
pub use config::{DurationConfig, DurationType, EngineConfig, SecurityProvider, SecuritySettings};
pub use endpoint::ListenEndpoint;
pub use engine::LeaseEngine;
pub use error::{Error, Result};
pub use identifier::{LeaseHandle, LeaseRelationshipIdentifier};
pub use lease::EstablishedLease;
pub use time::Instance;
pub use ttl::RemoteLeaseExpiration;
