//! Failsafe tasks
//!
//! A failsafe task is a unit of work that can be pointed at a replica and
//! retried elsewhere when that replica fails. Two strategies pick replicas:
//!
//! - **primary**: only the primary with the highest term. `NotPrimary` and
//!   `Unreachable` trigger a pause, rediscovery and another attempt, up to
//!   the configured budget.
//! - **any**: the preferred replica first, then every other one in turn.
//!   Only `Unreachable` moves on to the next candidate.
//!
//! Every other error, including server domain errors, is returned as is.

use crate::config::FailsafeConfig;
use crate::database::ClusterDatabaseManager;
use crate::metrics::{record_discovery, record_failsafe_exhausted, record_failsafe_retry};
use crate::replica::Replica;
use async_trait::async_trait;
use quiver::Result;
use tracing::{debug, warn};

#[async_trait]
pub trait FailsafeTask: Send + Sync {
    type Output: Send;

    /// First attempt of the task
    async fn run(&self, replica: &Replica) -> Result<Self::Output>;

    /// Every later attempt
    async fn rerun(&self, replica: &Replica) -> Result<Self::Output> {
        self.run(replica).await
    }
}

/// Run `task` against the primary replica of `database`
pub async fn run_primary_replica<T: FailsafeTask>(
    databases: &ClusterDatabaseManager,
    config: &FailsafeConfig,
    database: &str,
    task: &T,
) -> Result<T::Output> {
    let cached = databases
        .get(database)
        .and_then(|db| db.primary_replica().cloned());
    let mut replica = match cached {
        Some(replica) => replica,
        None => seek_primary_replica(databases, config, database).await?,
    };

    let mut attempt = 1;
    loop {
        let res = if attempt == 1 {
            task.run(&replica).await
        } else {
            task.rerun(&replica).await
        };

        let err = match res {
            Ok(output) => return Ok(output),
            Err(e) if e.is_unreachable() || e.is_not_primary() => e,
            Err(e) => return Err(e),
        };

        if err.is_unreachable() {
            databases.pool().evict(replica.address());
        }
        if attempt >= config.primary_max_attempts {
            record_failsafe_exhausted("primary");
            warn!(
                database = %database,
                attempts = attempt,
                error = %err,
                "Giving up on primary replica"
            );
            return Err(databases.unavailable());
        }

        record_failsafe_retry("primary", err.error_type());
        debug!(
            database = %database,
            replica = %replica.id,
            attempt = attempt,
            error = %err,
            "Primary replica failed, rediscovering"
        );
        tokio::time::sleep(config.wait_for_primary()).await;
        replica = seek_primary_replica(databases, config, database).await?;
        attempt += 1;
    }
}

/// Run `task` against the preferred replica of `database`, falling back
/// to the others while they are unreachable
pub async fn run_any_replica<T: FailsafeTask>(
    databases: &ClusterDatabaseManager,
    database: &str,
    task: &T,
) -> Result<T::Output> {
    let cluster_database = match databases.get(database) {
        Some(db) => db,
        None => databases.fetch_database_replicas(database).await?,
    };

    for (i, replica) in cluster_database.any_replica_candidates().iter().enumerate() {
        let res = if i == 0 {
            task.run(replica).await
        } else {
            task.rerun(replica).await
        };

        match res {
            Ok(output) => return Ok(output),
            Err(e) if e.is_unreachable() => {
                databases.pool().evict(replica.address());
                record_failsafe_retry("any", e.error_type());
                debug!(
                    database = %database,
                    replica = %replica.id,
                    error = %e,
                    "Replica unreachable, trying next"
                );
            }
            Err(e) => return Err(e),
        }
    }

    record_failsafe_exhausted("any");
    Err(databases.unavailable())
}

/// Rediscover `database` until a primary is elected or the budget runs out
async fn seek_primary_replica(
    databases: &ClusterDatabaseManager,
    config: &FailsafeConfig,
    database: &str,
) -> Result<Replica> {
    for round in 1..=config.fetch_replicas_max_attempts {
        let cluster_database = databases.fetch_database_replicas(database).await?;
        if let Some(primary) = cluster_database.primary_replica() {
            return Ok(primary.clone());
        }

        record_discovery("no_primary");
        debug!(database = %database, round = round, "No primary elected yet");
        if round < config.fetch_replicas_max_attempts {
            tokio::time::sleep(config.wait_for_primary()).await;
        }
    }
    record_failsafe_exhausted("primary");
    Err(databases.unavailable())
}

/// Task built from a closure, for one-off operations
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> FailsafeTask for FnTask<F>
where
    F: Fn(Replica) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T>> + Send,
    T: Send,
{
    type Output = T;

    async fn run(&self, replica: &Replica) -> Result<T> {
        (self.f)(replica.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use parking_lot::Mutex;
    use quiver::testing::{replica, MockConnector, MockNode};
    use quiver::Error;
    use std::sync::Arc;

    fn fast_config() -> FailsafeConfig {
        FailsafeConfig {
            primary_max_attempts: 10,
            fetch_replicas_max_attempts: 10,
            wait_for_primary_ms: 1,
        }
    }

    fn cluster(addresses: &[&str]) -> (MockConnector, Vec<MockNode>, ClusterDatabaseManager) {
        let connector = MockConnector::new();
        let nodes = addresses.iter().map(|a| connector.add_node(a)).collect();
        let pool = Arc::new(ConnectionPool::new(Arc::new(connector.clone())));
        let members = addresses.iter().map(|a| a.to_string()).collect();
        (connector, nodes, ClusterDatabaseManager::new(pool, members))
    }

    /// Records the replica of every attempt and answers from a script
    struct ScriptedTask {
        attempts: Mutex<Vec<(String, bool)>>,
        outcome: Box<dyn Fn(&Replica, usize) -> Result<String> + Send + Sync>,
    }

    impl ScriptedTask {
        fn new(outcome: impl Fn(&Replica, usize) -> Result<String> + Send + Sync + 'static) -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                outcome: Box::new(outcome),
            }
        }

        fn attempt(&self, replica: &Replica, rerun: bool) -> Result<String> {
            let mut attempts = self.attempts.lock();
            attempts.push((replica.address().to_string(), rerun));
            (self.outcome)(replica, attempts.len())
        }

        fn attempts(&self) -> Vec<(String, bool)> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl FailsafeTask for ScriptedTask {
        type Output = String;

        async fn run(&self, replica: &Replica) -> Result<String> {
            self.attempt(replica, false)
        }

        async fn rerun(&self, replica: &Replica) -> Result<String> {
            self.attempt(replica, true)
        }
    }

    #[tokio::test]
    async fn test_primary_runs_on_highest_term() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas(
            "social",
            vec![
                replica("a:1729", 3, true, false),
                replica("b:1729", 5, true, false),
                replica("c:1729", 5, false, false),
            ],
        );
        let task = ScriptedTask::new(|r, _| Ok(r.address().to_string()));

        let out = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap();

        assert_eq!(out, "b:1729");
        assert_eq!(task.attempts(), vec![("b:1729".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_primary_fails_over_after_not_primary() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        let node = nodes[0].clone();
        node.set_replicas("social", vec![replica("a:1729", 1, true, false)]);
        let node_in_task = node.clone();
        let task = ScriptedTask::new(move |r, n| {
            if n == 1 {
                // Election happened behind our back
                node_in_task.set_replicas(
                    "social",
                    vec![replica("a:1729", 1, false, false), replica("b:1729", 2, true, false)],
                );
                Err(Error::NotPrimary(format!("{} is not primary", r.address())))
            } else {
                Ok(r.address().to_string())
            }
        });

        let out = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap();

        assert_eq!(out, "b:1729");
        assert_eq!(
            task.attempts(),
            vec![("a:1729".to_string(), false), ("b:1729".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_primary_budget_exhausted() {
        let (_, nodes, databases) = cluster(&["a:1729", "b:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, true, false)]);
        let task = ScriptedTask::new(|r, _| Err(Error::unreachable(r.address(), "reset")));

        let err = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap_err();

        assert_eq!(task.attempts().len(), 10);
        assert_eq!(
            err,
            Error::ClusterUnavailable {
                addresses: vec!["a:1729".to_string(), "b:1729".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_primary_does_not_retry_domain_errors() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, true, false)]);
        let task = ScriptedTask::new(|_, _| Err(Error::Domain("type 'person' not found".into())));

        let err = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap_err();

        assert_eq!(err, Error::Domain("type 'person' not found".into()));
        assert_eq!(task.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_waits_for_election() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, false, false)]);
        let task = ScriptedTask::new(|r, _| Ok(r.address().to_string()));

        let node = nodes[0].clone();
        let elect = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
            node.set_replicas("social", vec![replica("a:1729", 2, true, false)]);
        });

        let config = FailsafeConfig {
            fetch_replicas_max_attempts: 1000,
            ..fast_config()
        };
        let out = run_primary_replica(&databases, &config, "social", &task)
            .await
            .unwrap();
        elect.await.unwrap();

        assert_eq!(out, "a:1729");
    }

    #[tokio::test]
    async fn test_primary_never_elected() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, false, false)]);
        let task = ScriptedTask::new(|r, _| Ok(r.address().to_string()));

        let err = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClusterUnavailable { .. }));
        assert!(task.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_any_falls_back_from_unreachable_preferred() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas(
            "social",
            vec![
                replica("a:1729", 1, true, false),
                replica("b:1729", 1, false, true),
                replica("c:1729", 1, false, false),
            ],
        );
        let task = ScriptedTask::new(|r, _| {
            if r.address() == "b:1729" {
                Err(Error::unreachable(r.address(), "refused"))
            } else {
                Ok(r.address().to_string())
            }
        });

        let out = run_any_replica(&databases, "social", &task).await.unwrap();

        assert_eq!(out, "a:1729");
        assert_eq!(
            task.attempts(),
            vec![("b:1729".to_string(), false), ("a:1729".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_any_exhausts_candidates() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas(
            "social",
            vec![replica("a:1729", 1, true, false), replica("b:1729", 1, false, false)],
        );
        let task = ScriptedTask::new(|r, _| Err(Error::unreachable(r.address(), "refused")));

        let err = run_any_replica(&databases, "social", &task).await.unwrap_err();

        assert!(matches!(err, Error::ClusterUnavailable { .. }));
        assert_eq!(task.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_any_does_not_retry_not_primary() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas(
            "social",
            vec![replica("a:1729", 1, true, false), replica("b:1729", 1, false, false)],
        );
        let task = ScriptedTask::new(|_, _| Err(Error::NotPrimary("read only".into())));

        let err = run_any_replica(&databases, "social", &task).await.unwrap_err();

        assert!(err.is_not_primary());
        assert_eq!(task.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_any_uses_cached_replicas() {
        let (connector, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, true, true)]);
        let task = ScriptedTask::new(|r, _| Ok(r.address().to_string()));

        run_any_replica(&databases, "social", &task).await.unwrap();
        nodes[0].set_reachable(false);
        run_any_replica(&databases, "social", &task).await.unwrap();

        // Only the first call needed discovery
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_fn_task() {
        let (_, nodes, databases) = cluster(&["a:1729"]);
        nodes[0].set_replicas("social", vec![replica("a:1729", 1, true, false)]);
        let task = FnTask::new(|r: Replica| async move { Ok::<_, Error>(r.term) });

        let term = run_primary_replica(&databases, &fast_config(), "social", &task)
            .await
            .unwrap();
        assert_eq!(term, 1);
    }
}
