use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::accrual::poller::Shutdown;
use crate::accrual::queue::{AccrualQueue, Enqueued};
use crate::error::StoreError;
use crate::ledger::{BalanceLedger, OrderLedger};
use crate::models::UserId;
use crate::money;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub in_flight: usize,
    pub rejected: usize,
}

/// Enqueues every unfinished order that is not already queued or being polled.
pub async fn requeue_unfinished(orders: &dyn OrderLedger, queue: &AccrualQueue) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport::default();
    for number in orders.unfinished_orders().await? {
        match queue.enqueue(&number) {
            Enqueued::Accepted => report.requeued += 1,
            Enqueued::AlreadyClaimed => report.in_flight += 1,
            Enqueued::Displaced(dropped) => {
                report.requeued += 1;
                warn!(order = %dropped, "accrual queue full, order displaced until the next sweep");
            }
            Enqueued::Rejected => report.rejected += 1,
            Enqueued::Closed => break,
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub owner: UserId,
    pub current: BigDecimal,
    pub expected: BigDecimal,
}

/// Balances that differ from accruals of PROCESSED orders minus withdrawals.
pub async fn reconcile(orders: &dyn OrderLedger, balances: &dyn BalanceLedger) -> Result<Vec<Discrepancy>, StoreError> {
    let credited = orders.processed_totals().await?;
    let mut discrepancies = Vec::new();
    for snapshot in balances.snapshots().await? {
        let accrued = credited.get(&snapshot.owner).cloned().unwrap_or_else(money::zero);
        let expected = money::normalize(accrued - &snapshot.withdrawn);
        if money::normalize(snapshot.current.clone()) != expected {
            discrepancies.push(Discrepancy {
                owner: snapshot.owner,
                current: snapshot.current,
                expected,
            });
        }
    }
    Ok(discrepancies)
}

/// Remembers mismatches between sweeps.
///
/// A mismatch is confirmed once two consecutive sweeps see the same figures.
/// A single sighting may be a poller between marking an order PROCESSED and
/// crediting it.
#[derive(Debug, Default)]
pub struct Reconciler {
    suspects: HashMap<UserId, Discrepancy>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm(&mut self, found: Vec<Discrepancy>) -> Vec<Discrepancy> {
        let mut confirmed = Vec::new();
        let mut suspects = HashMap::with_capacity(found.len());
        for d in found {
            if self.suspects.get(&d.owner) == Some(&d) {
                confirmed.push(d.clone());
            } else {
                debug!(
                    user = %d.owner,
                    current = %d.current,
                    expected = %d.expected,
                    "balance mismatch, rechecking on the next sweep"
                );
            }
            suspects.insert(d.owner, d);
        }
        self.suspects = suspects;
        confirmed
    }
}

/// One sweep: requeue, then reconcile. Failures are logged, the next tick tries again.
pub async fn sweep_once(
    orders: &dyn OrderLedger,
    balances: &dyn BalanceLedger,
    queue: &AccrualQueue,
    reconciler: &mut Reconciler,
) {
    match requeue_unfinished(orders, queue).await {
        Ok(report) if report.requeued > 0 || report.rejected > 0 => info!(
            requeued = report.requeued,
            in_flight = report.in_flight,
            rejected = report.rejected,
            queued = queue.len(),
            "unfinished orders requeued"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "recovery sweep failed"),
    }
    match reconcile(orders, balances).await {
        Ok(discrepancies) => {
            for d in reconciler.confirm(discrepancies) {
                error!(
                    user = %d.owner,
                    current = %d.current,
                    expected = %d.expected,
                    "balance does not match order and withdrawal history"
                );
            }
        }
        Err(e) => error!(error = %e, "balance reconciliation failed"),
    }
}

/// Sweeps right away, then every `interval`, until shutdown.
pub async fn run_sweeper(
    orders: Arc<dyn OrderLedger>,
    balances: Arc<dyn BalanceLedger>,
    queue: Arc<AccrualQueue>,
    interval: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reconciler = Reconciler::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => sweep_once(orders.as_ref(), balances.as_ref(), &queue, &mut reconciler).await,
        }
    }
    info!("recovery sweeper stopped");
}
