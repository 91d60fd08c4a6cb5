use crate::time::Instance;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// (local application, remote application) pair naming one lease relationship.
///
/// The ordering is the table key everywhere an RLA keeps identifiers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseRelationshipIdentifier {
    pub local_app: String,
    pub remote_app: String,
}

impl LeaseRelationshipIdentifier {
    pub fn new(local_app: impl Into<String>, remote_app: impl Into<String>) -> Self {
        Self {
            local_app: local_app.into(),
            remote_app: remote_app.into(),
        }
    }

    /// The same relationship seen from the other side of the wire.
    pub fn swapped(&self) -> Self {
        Self {
            local_app: self.remote_app.clone(),
            remote_app: self.local_app.clone(),
        }
    }
}

impl fmt::Display for LeaseRelationshipIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local_app, self.remote_app)
    }
}

pub type IdentifierSet = BTreeSet<LeaseRelationshipIdentifier>;

/// Externally visible handle for an established (or pending) subject lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseHandle(pub Instance);

/// Subject table: identifier to the handle issued when it was first established.
pub type SubjectTable = BTreeMap<LeaseRelationshipIdentifier, LeaseHandle>;

/// The nine pending-identifier list categories carried by every lease message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingLists {
    pub subject_pending: IdentifierSet,
    pub subject_failed_pending: IdentifierSet,
    pub monitor_failed_pending: IdentifierSet,
    pub subject_pending_accepted: IdentifierSet,
    pub subject_failed_accepted: IdentifierSet,
    pub monitor_failed_accepted: IdentifierSet,
    pub subject_pending_rejected: IdentifierSet,
    pub subject_terminate_pending: IdentifierSet,
    pub subject_terminate_accepted: IdentifierSet,
}

impl PendingLists {
    pub fn is_empty(&self) -> bool {
        self.iter().all(BTreeSet::is_empty)
    }

    /// Lists in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentifierSet> {
        [
            &self.subject_pending,
            &self.subject_failed_pending,
            &self.monitor_failed_pending,
            &self.subject_pending_accepted,
            &self.subject_failed_accepted,
            &self.monitor_failed_accepted,
            &self.subject_pending_rejected,
            &self.subject_terminate_pending,
            &self.subject_terminate_accepted,
        ]
        .into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IdentifierSet> {
        [
            &mut self.subject_pending,
            &mut self.subject_failed_pending,
            &mut self.monitor_failed_pending,
            &mut self.subject_pending_accepted,
            &mut self.subject_failed_accepted,
            &mut self.monitor_failed_accepted,
            &mut self.subject_pending_rejected,
            &mut self.subject_terminate_pending,
            &mut self.subject_terminate_accepted,
        ]
        .into_iter()
    }
}
