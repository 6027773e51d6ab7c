//! Periodic lease renewal.

use std::sync::Arc;

use tokio::time::sleep;

use super::LeaseManager;
use crate::shutdown::Shutdown;

/// Renew every held lease once per `update_interval - leeway` until
/// shutdown.
///
/// Each pass completes before the next sleep starts, so passes never
/// overlap. A failed pass means this process can no longer prove it holds
/// its leases: the failure is reported through `shutdown` as fatal and the
/// loop ends.
pub async fn run_renewal(leases: Arc<LeaseManager>, shutdown: Shutdown) {
    let period = leases.timing().renewal_period();
    tracing::info!(period_secs = period.as_secs(), "Lease renewal started");

    loop {
        tokio::select! {
            _ = sleep(period) => {}
            _ = shutdown.cancelled() => break,
        }

        let pass = {
            let leases = leases.clone();
            tokio::task::spawn_blocking(move || leases.renew_all()).await
        };

        match pass {
            Ok(Ok(report)) => {
                if report.renewed > 0 || report.revoked > 0 {
                    tracing::debug!(
                        renewed = report.renewed,
                        revoked = report.revoked,
                        "Lease renewal pass finished"
                    );
                }
            }
            Ok(Err(e)) => {
                shutdown.fatal(format!("lease renewal failed: {e}"));
                break;
            }
            Err(e) => {
                shutdown.fatal(format!("lease renewal task panicked: {e}"));
                break;
            }
        }
    }

    tracing::info!("Lease renewal stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::tests::MockStore;
    use crate::lease::LeaseTiming;
    use ingestd_common::{ArtifactId, OwnerToken};
    use std::time::Duration;

    #[tokio::test]
    async fn test_renewal_keeps_heartbeat_fresh() {
        let store = Arc::new(MockStore::new());
        store.insert(1, None);
        let timing = LeaseTiming::new(Duration::from_millis(200), Duration::from_millis(150));
        let leases = Arc::new(LeaseManager::new(store.clone(), timing));
        leases.acquire(ArtifactId::new(1), OwnerToken::new(), false).unwrap();
        let first = store.heartbeat(1).unwrap();

        let shutdown = Shutdown::new();
        let task = tokio::spawn(run_renewal(leases.clone(), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(180)).await;
        shutdown.trigger();
        task.await.unwrap();

        assert!(store.heartbeat(1).unwrap() > first);
        assert!(leases.is_leased(ArtifactId::new(1)));
        assert!(shutdown.fatal_reason().is_none());
    }

    #[tokio::test]
    async fn test_renewal_failure_triggers_fatal_shutdown() {
        let store = Arc::new(MockStore::new());
        store.insert(1, None);
        let timing = LeaseTiming::new(Duration::from_millis(60), Duration::from_millis(40));
        let leases = Arc::new(LeaseManager::new(store.clone(), timing));
        leases.acquire(ArtifactId::new(1), OwnerToken::new(), false).unwrap();
        store.set_failing(true);

        let shutdown = Shutdown::new();
        tokio::time::timeout(Duration::from_secs(5), run_renewal(leases, shutdown.clone()))
            .await
            .unwrap();

        assert!(shutdown.is_cancelled());
        assert!(shutdown.fatal_reason().unwrap().contains("lease renewal failed"));
    }
}
