//! The byte-stream seam between lease agents and the network.

use crate::{config::SecuritySettings, endpoint::ListenEndpoint, message::MessageType, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Reliable ordered delivery of whole lease messages between listen endpoints.
///
/// Connections are keyed by (local listener, remote listener); `send` connects on demand.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn listen(
        &self,
        local: &ListenEndpoint,
        security: &SecuritySettings,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()>;

    async fn send(&self, local: &ListenEndpoint, remote: &ListenEndpoint, frame: Bytes) -> Result<()>;

    /// Drops the connection to `remote`; queued frames are discarded.
    fn abort(&self, local: &ListenEndpoint, remote: &ListenEndpoint);

    /// Stops listening on `local` and drops all of its connections.
    fn close(&self, local: &ListenEndpoint);

    fn update_security(&self, local: &ListenEndpoint, security: &SecuritySettings);
}

/// Callbacks a transport invokes for one listener.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Accept decision for a new inbound connection.
    fn accept(&self, local: &ListenEndpoint, remote: &ListenEndpoint) -> bool;

    /// A complete frame received from the peer listening on `remote`.
    fn deliver(&self, remote: &ListenEndpoint, frame: Bytes);

    /// Verdict on a peer certificate, possibly after asking an application.
    async fn verify_certificate(&self, remote: &ListenEndpoint, certificate: Bytes) -> bool;
}

/// Message classes a test behaviour can drop on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingType {
    LeaseEstablishAction,
    LeaseEstablishResponse,
    LeasePingRequest,
    LeasePingResponse,
    LeaseIndirect,
    BlockingAll,
}

impl BlockingType {
    pub fn blocks(self, message_type: MessageType) -> bool {
        match self {
            BlockingType::BlockingAll => true,
            BlockingType::LeaseEstablishAction => message_type == MessageType::LeaseRequest,
            BlockingType::LeaseEstablishResponse => message_type == MessageType::LeaseResponse,
            BlockingType::LeasePingRequest => message_type == MessageType::PingRequest,
            BlockingType::LeasePingResponse => message_type == MessageType::PingResponse,
            BlockingType::LeaseIndirect => message_type.is_forward() || message_type.is_relay(),
        }
    }
}

/// A rule dropping inbound messages. `None` endpoints match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBehavior {
    pub alias: String,
    /// Sender of the message.
    pub from: Option<ListenEndpoint>,
    /// Listener receiving the message.
    pub to: Option<ListenEndpoint>,
    pub blocking: BlockingType,
}

impl TransportBehavior {
    fn matches(&self, from: &ListenEndpoint, to: &ListenEndpoint, message_type: MessageType) -> bool {
        self.from.as_ref().map_or(true, |f| f == from)
            && self.to.as_ref().map_or(true, |t| t == to)
            && self.blocking.blocks(message_type)
    }
}

#[derive(Debug, Default)]
pub struct TransportBehaviorTable {
    rules: RwLock<Vec<TransportBehavior>>,
}

impl TransportBehaviorTable {
    pub fn add(&self, rule: TransportBehavior) {
        tracing::info!(alias = %rule.alias, blocking = ?rule.blocking, "adding transport behavior");
        self.rules.write().push(rule);
    }

    /// Removes rules with `alias`, or every rule when `alias` is empty.
    pub fn clear(&self, alias: &str) {
        let mut rules = self.rules.write();
        if alias.is_empty() {
            rules.clear();
        } else {
            rules.retain(|rule| rule.alias != alias);
        }
    }

    pub fn is_blocked(&self, from: &ListenEndpoint, to: &ListenEndpoint, message_type: MessageType) -> bool {
        self.rules
            .read()
            .iter()
            .any(|rule| rule.matches(from, to, message_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_rules() {
        let a = ListenEndpoint::new("a", 1);
        let b = ListenEndpoint::new("b", 1);
        let table = TransportBehaviorTable::default();
        table.add(TransportBehavior {
            alias: "pings".into(),
            from: Some(a.clone()),
            to: None,
            blocking: BlockingType::LeasePingRequest,
        });
        assert!(table.is_blocked(&a, &b, MessageType::PingRequest));
        assert!(!table.is_blocked(&b, &a, MessageType::PingRequest));
        assert!(!table.is_blocked(&a, &b, MessageType::LeaseRequest));

        table.add(TransportBehavior {
            alias: "all".into(),
            from: None,
            to: Some(a.clone()),
            blocking: BlockingType::BlockingAll,
        });
        assert!(table.is_blocked(&b, &a, MessageType::LeaseResponse));

        table.clear("pings");
        assert!(!table.is_blocked(&a, &b, MessageType::PingRequest));
        table.clear("");
        assert!(!table.is_blocked(&b, &a, MessageType::LeaseResponse));
    }

    #[test]
    fn test_indirect_blocking_covers_both_hops() {
        let a = ListenEndpoint::new("a", 1);
        let b = ListenEndpoint::new("b", 1);
        let table = TransportBehaviorTable::default();
        table.add(TransportBehavior {
            alias: "indirect".into(),
            from: Some(a.clone()),
            to: Some(b.clone()),
            blocking: BlockingType::LeaseIndirect,
        });
        for message_type in [
            MessageType::ForwardRequest,
            MessageType::ForwardResponse,
            MessageType::RelayRequest,
            MessageType::RelayResponse,
        ] {
            assert!(table.is_blocked(&a, &b, message_type), "{message_type:?}");
            assert!(!table.is_blocked(&b, &a, message_type));
        }
        for message_type in [
            MessageType::LeaseRequest,
            MessageType::LeaseResponse,
            MessageType::PingRequest,
            MessageType::PingResponse,
        ] {
            assert!(!table.is_blocked(&a, &b, message_type), "{message_type:?}");
        }
    }
}
