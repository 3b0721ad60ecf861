//! Replica model
//!
//! A `ClusterDatabase` is the client's view of where one database lives.
//! It is rebuilt wholesale from each discovery response; nothing is merged.

use quiver::{DatabaseReplicas, ReplicaInfo};
use std::fmt;

/// Identity of one copy of a database
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaId {
    pub address: String,
    pub database: String,
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.database)
    }
}

/// One copy of a database as last reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: ReplicaId,
    /// Election term this replica last observed
    pub term: u64,
    pub is_primary: bool,
    pub is_preferred: bool,
}

impl Replica {
    pub fn from_info(database: &str, info: &ReplicaInfo) -> Self {
        Self {
            id: ReplicaId {
                address: info.address.clone(),
                database: database.to_string(),
            },
            term: info.term,
            is_primary: info.is_primary,
            is_preferred: info.is_preferred,
        }
    }

    pub fn address(&self) -> &str {
        &self.id.address
    }
}

/// Replicas of one database, sorted by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDatabase {
    name: String,
    replicas: Vec<Replica>,
}

impl ClusterDatabase {
    pub fn new(name: &str, mut replicas: Vec<Replica>) -> Self {
        replicas.sort_by(|a, b| a.id.address.cmp(&b.id.address));
        Self {
            name: name.to_string(),
            replicas,
        }
    }

    pub fn from_replicas(info: &DatabaseReplicas) -> Self {
        let replicas = info
            .replicas
            .iter()
            .map(|r| Replica::from_info(&info.name, r))
            .collect();
        Self::new(&info.name, replicas)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// The primary with the highest term, if any replica claims to be primary
    pub fn primary_replica(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .filter(|r| r.is_primary)
            .max_by_key(|r| r.term)
    }

    /// The replica flagged preferred, otherwise the first one
    pub fn preferred_replica(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.is_preferred)
            .or_else(|| self.replicas.first())
    }

    /// Preferred replica first, then every other replica in address order
    pub fn any_replica_candidates(&self) -> Vec<Replica> {
        let Some(preferred) = self.preferred_replica() else {
            return Vec::new();
        };
        let mut candidates = vec![preferred.clone()];
        candidates.extend(
            self.replicas
                .iter()
                .filter(|r| r.id != preferred.id)
                .cloned(),
        );
        candidates
    }
}

impl fmt::Display for ClusterDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.name)?;
        for (i, replica) in self.replicas.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", replica.id.address)?;
            if replica.is_primary {
                write!(f, " (primary, term {})", replica.term)?;
            }
        }
        write!(f, "]")
    }
}
