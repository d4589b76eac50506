//! Reconciliation loop
//!
//! Periodically compares the peer store against the live interface and
//! corrects divergence: store-active peers the runtime lost are re-applied,
//! runtime peers the store does not know are flagged for the operator.

use crate::provision::Provisioner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Reconciler that keeps the runtime aligned with the store
pub struct Reconciler {
    provisioner: Arc<Provisioner>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(provisioner: Arc<Provisioner>, interval: Duration) -> Self {
        Self {
            provisioner,
            interval,
        }
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        info!("Reconciler started, interval {:?}", self.interval);

        loop {
            tokio::time::sleep(self.interval).await;

            match self.provisioner.reconcile().await {
                Ok(report) => {
                    if report.reapplied.is_empty() && report.unknown.is_empty() {
                        debug!("Reconciliation pass: no divergence");
                    } else {
                        info!(
                            "Reconciliation pass: re-applied {}, flagged {} unknown",
                            report.reapplied.len(),
                            report.unknown.len()
                        );
                    }
                }
                Err(e) => {
                    error!("Reconciliation error: {}", e);
                }
            }
        }
    }
}
