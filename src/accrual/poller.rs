use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::accrual::client::{AccrualClient, AccrualReply, AccrualStatus, AccrualVerdict};
use crate::accrual::queue::AccrualQueue;
use crate::accrual::retry::{Decision, Outcome, RetryPolicy};
use crate::error::StoreError;
use crate::ledger::{BalanceLedger, OrderLedger};
use crate::models::{OrderStatus, UserId};
use crate::money;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("order {number}: storage failure: {source}")]
    Store { number: String, source: StoreError },

    #[error("order {number}: no final verdict after {attempts} attempts, last outcome: {last}")]
    Exhausted {
        number: String,
        attempts: u32,
        last: String,
    },

    #[error("order {number}: accrual service answer not usable: {reason}")]
    Rejected { number: String, reason: String },

    #[error("order {number}: polling interrupted by shutdown")]
    Aborted { number: String },

    #[error("order {number}: PROCESSED but crediting {accrual} to user {owner} failed, balance needs reconciliation: {source}")]
    CreditFailed {
        number: String,
        owner: UserId,
        accrual: BigDecimal,
        source: StoreError,
    },

    #[error("order {number}: worker panicked: {message}")]
    Panicked { number: String, message: String },
}

impl PollError {
    pub fn number(&self) -> &str {
        match self {
            PollError::Store { number, .. }
            | PollError::Exhausted { number, .. }
            | PollError::Rejected { number, .. }
            | PollError::Aborted { number }
            | PollError::CreditFailed { number, .. }
            | PollError::Panicked { number, .. } => number,
        }
    }
}

/// Where per-order failures go. Backed by a bounded channel; when the
/// channel is full or gone the error is logged in place.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<PollError>,
}

impl ErrorSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PollError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn report(&self, err: PollError) {
        if let Err(e) = self.tx.try_send(err) {
            let err = match e {
                mpsc::error::TrySendError::Full(err) | mpsc::error::TrySendError::Closed(err) => err,
            };
            error!(order = err.number(), error = %err, "accrual processing failed (error sink unavailable)");
        }
    }
}

pub async fn drain_errors(mut rx: mpsc::Receiver<PollError>) {
    while let Some(err) = rx.recv().await {
        error!(order = err.number(), error = %err, "accrual processing failed");
    }
}

/// Shutdown signal shared by all background tasks.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once shutdown is requested. A dropped sender never triggers it.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

pub struct AccrualPoller {
    queue: Arc<AccrualQueue>,
    client: Arc<dyn AccrualClient>,
    orders: Arc<dyn OrderLedger>,
    balances: Arc<dyn BalanceLedger>,
    policy: RetryPolicy,
    errors: ErrorSink,
}

impl AccrualPoller {
    pub fn new(
        queue: Arc<AccrualQueue>,
        client: Arc<dyn AccrualClient>,
        orders: Arc<dyn OrderLedger>,
        balances: Arc<dyn BalanceLedger>,
        policy: RetryPolicy,
        errors: ErrorSink,
    ) -> Self {
        Self {
            queue,
            client,
            orders,
            balances,
            policy,
            errors,
        }
    }

    /// Worker loop. Runs until shutdown is requested or the queue is closed;
    /// the order in hand when shutdown arrives is finished or abandoned, never
    /// left half-written.
    pub async fn run(self: Arc<Self>, worker: usize, mut shutdown: Shutdown) {
        info!(worker, policy = ?self.policy, "accrual worker started");
        loop {
            let lease = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                lease = self.queue.dequeue() => match lease {
                    Some(lease) => lease,
                    None => break,
                },
            };
            let number = lease.number().to_string();
            let handled = AssertUnwindSafe(self.process(&number, &mut shutdown))
                .catch_unwind()
                .await;
            drop(lease);
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.errors.report(err),
                Err(panic) => self.errors.report(PollError::Panicked {
                    number,
                    message: panic_message(panic.as_ref()),
                }),
            }
        }
        info!(worker, "accrual worker stopped");
    }

    #[instrument(skip(self, shutdown))]
    pub async fn process(&self, number: &str, shutdown: &mut Shutdown) -> Result<(), PollError> {
        let store_err = |source: StoreError| PollError::Store {
            number: number.to_string(),
            source,
        };

        let order = self.orders.get_by_number(number).await.map_err(store_err)?;
        if order.status.is_terminal() {
            debug!(status = %order.status, "order already settled");
            return Ok(());
        }
        match self.orders.update_order(number, OrderStatus::Processing, None).await {
            Ok(_) => {}
            Err(StoreError::IllegalTransition { .. }) => {
                debug!("order settled concurrently");
                return Ok(());
            }
            Err(e) => return Err(store_err(e)),
        }

        let verdict = self.poll(number, shutdown).await?;
        self.commit(number, verdict).await
    }

    async fn poll(&self, number: &str, shutdown: &mut Shutdown) -> Result<AccrualVerdict, PollError> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            let outcome = self.client.fetch(number).await;
            attempts += 1;
            match (self.policy.classify)(&outcome) {
                Decision::Done => {
                    return match outcome {
                        Ok(AccrualReply::Verdict(verdict)) => Ok(verdict),
                        other => Err(PollError::Rejected {
                            number: number.to_string(),
                            reason: describe(&other),
                        }),
                    }
                }
                Decision::Fail => {
                    return Err(PollError::Rejected {
                        number: number.to_string(),
                        reason: describe(&outcome),
                    })
                }
                Decision::Retry => {}
            }

            let delay = self.policy.delay_after(attempts - 1, &outcome);
            if !self.policy.should_retry(attempts) || started.elapsed() + delay > self.policy.max_elapsed {
                return Err(PollError::Exhausted {
                    number: number.to_string(),
                    attempts,
                    last: describe(&outcome),
                });
            }
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                outcome = %describe(&outcome),
                "accrual verdict not ready, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => {
                    return Err(PollError::Aborted { number: number.to_string() });
                }
            }
        }
    }

    async fn commit(&self, number: &str, verdict: AccrualVerdict) -> Result<(), PollError> {
        let store_err = |source: StoreError| PollError::Store {
            number: number.to_string(),
            source,
        };
        if verdict.order != number {
            return Err(PollError::Rejected {
                number: number.to_string(),
                reason: format!("verdict is for order {}", verdict.order),
            });
        }
        match verdict.status {
            AccrualStatus::Invalid => {
                match self.orders.update_order(number, OrderStatus::Invalid, None).await {
                    Ok(_) => info!(status = "INVALID", "order settled"),
                    Err(StoreError::IllegalTransition { .. }) => debug!("order settled concurrently"),
                    Err(e) => return Err(store_err(e)),
                }
                Ok(())
            }
            AccrualStatus::Processed => {
                let accrual = verdict.accrual.map(money::normalize).unwrap_or_else(money::zero);
                if accrual < money::zero() {
                    return Err(PollError::Rejected {
                        number: number.to_string(),
                        reason: format!("negative accrual {accrual}"),
                    });
                }
                let owner = match self
                    .orders
                    .update_order(number, OrderStatus::Processed, Some(accrual.clone()))
                    .await
                {
                    Ok(owner) => owner,
                    Err(StoreError::IllegalTransition { .. }) => {
                        // whoever settled it also credited it
                        debug!("order settled concurrently");
                        return Ok(());
                    }
                    Err(e) => return Err(store_err(e)),
                };
                if money::is_positive(&accrual) {
                    self.balances
                        .credit_balance(owner, &accrual)
                        .await
                        .map_err(|source| PollError::CreditFailed {
                            number: number.to_string(),
                            owner,
                            accrual: accrual.clone(),
                            source,
                        })?;
                }
                info!(status = "PROCESSED", %owner, %accrual, "order settled");
                Ok(())
            }
            status => Err(PollError::Rejected {
                number: number.to_string(),
                reason: format!("{status:?} is not a final status"),
            }),
        }
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Ok(AccrualReply::Verdict(verdict)) => format!("status {:?}", verdict.status),
        Ok(AccrualReply::NotReady) => "204 no content".to_string(),
        Ok(AccrualReply::RateLimited { .. }) => "429 too many requests".to_string(),
        Ok(AccrualReply::ServerError(code)) => format!("{code} server error"),
        Err(e) => e.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::client::AccrualError;
    use crate::accrual::queue::OverflowPolicy;
    use crate::ledger::memory::MemoryStore;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted replies per order; the last one repeats.
    #[derive(Default)]
    struct ScriptedClient {
        scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn script(self, number: &str, replies: Vec<Outcome>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(number.to_string(), replies.into_iter().collect());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_outcome(outcome: &Outcome) -> Outcome {
        match outcome {
            Ok(reply) => Ok(reply.clone()),
            Err(AccrualError::Transport(msg)) => Err(AccrualError::Transport(msg.clone())),
            Err(AccrualError::UnexpectedStatus(code)) => Err(AccrualError::UnexpectedStatus(*code)),
            Err(AccrualError::Decode(_)) => Err(AccrualError::Transport("decode".to_string())),
        }
    }

    #[async_trait]
    impl AccrualClient for ScriptedClient {
        async fn fetch(&self, number: &str) -> Result<AccrualReply, AccrualError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(number).expect("unscripted order");
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                clone_outcome(script.front().unwrap())
            }
        }
    }

    struct PanickingClient;

    #[async_trait]
    impl AccrualClient for PanickingClient {
        async fn fetch(&self, number: &str) -> Result<AccrualReply, AccrualError> {
            panic!("accrual client exploded on {number}");
        }
    }

    fn verdict(number: &str, status: AccrualStatus, accrual: Option<&str>) -> Outcome {
        Ok(AccrualReply::Verdict(AccrualVerdict {
            order: number.to_string(),
            status,
            accrual: accrual.map(|a| BigDecimal::from_str(a).unwrap()),
        }))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
    }

    struct Harness {
        store: MemoryStore,
        queue: Arc<AccrualQueue>,
        poller: Arc<AccrualPoller>,
        errors: mpsc::Receiver<PollError>,
        shutdown_tx: watch::Sender<bool>,
    }

    impl Harness {
        async fn new(client: Arc<dyn AccrualClient>, policy: RetryPolicy) -> Self {
            let store = MemoryStore::new();
            store.create_balance(UserId(1)).await.unwrap();
            let queue = Arc::new(AccrualQueue::new(16, OverflowPolicy::Reject));
            let (sink, errors) = ErrorSink::new(16);
            let poller = Arc::new(AccrualPoller::new(
                queue.clone(),
                client,
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                policy,
                sink,
            ));
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                store,
                queue,
                poller,
                errors,
                shutdown_tx,
            }
        }

        fn shutdown(&self) -> Shutdown {
            Shutdown::new(self.shutdown_tx.subscribe())
        }

        async fn submit(&self, number: &str) {
            self.store.create_order(number, UserId(1)).await.unwrap();
        }

        async fn process(&self, number: &str) -> Result<(), PollError> {
            self.poller.process(number, &mut self.shutdown()).await
        }

        async fn balance(&self) -> BigDecimal {
            self.store.get_sum_and_withdrawals(UserId(1)).await.unwrap().current
        }
    }

    fn amount(v: &str) -> BigDecimal {
        BigDecimal::from_str(v).unwrap()
    }

    #[actix_web::test]
    async fn test_retries_until_processed_and_credits_once() {
        let client = Arc::new(ScriptedClient::default().script(
            "79927398713",
            vec![
                verdict("79927398713", AccrualStatus::Processing, None),
                verdict("79927398713", AccrualStatus::Processing, None),
                verdict("79927398713", AccrualStatus::Processing, None),
                verdict("79927398713", AccrualStatus::Processed, Some("500")),
            ],
        ));
        let harness = Harness::new(client.clone(), fast_policy()).await;
        harness.submit("79927398713").await;

        harness.process("79927398713").await.unwrap();

        let order = harness.store.get_by_number("79927398713").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(amount("500")));
        assert_eq!(harness.balance().await, amount("500"));
        assert_eq!(client.calls(), 4);

        // a second pass over a settled order changes nothing
        harness.process("79927398713").await.unwrap();
        assert_eq!(harness.balance().await, amount("500"));
        assert_eq!(client.calls(), 4);
    }

    #[actix_web::test]
    async fn test_invalid_verdict_has_no_balance_effect() {
        let client = Arc::new(ScriptedClient::default().script(
            "18",
            vec![
                Ok(AccrualReply::NotReady),
                Ok(AccrualReply::RateLimited { retry_after: None }),
                Ok(AccrualReply::ServerError(500)),
                Err(AccrualError::Transport("connection reset".into())),
                verdict("18", AccrualStatus::Invalid, None),
            ],
        ));
        let harness = Harness::new(client, fast_policy()).await;
        harness.submit("18").await;

        harness.process("18").await.unwrap();

        let order = harness.store.get_by_number("18").await.unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert!(order.accrual.is_none());
        assert_eq!(harness.balance().await, amount("0"));
    }

    #[actix_web::test]
    async fn test_exhausted_retries_leave_order_processing() {
        let client = Arc::new(
            ScriptedClient::default().script("26", vec![verdict("26", AccrualStatus::Registered, None)]),
        );
        let harness = Harness::new(client.clone(), fast_policy()).await;
        harness.submit("26").await;

        let err = harness.process("26").await.unwrap_err();
        assert!(matches!(err, PollError::Exhausted { attempts: 5, .. }), "{err}");
        assert_eq!(client.calls(), 5);

        let order = harness.store.get_by_number("26").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(harness.store.unfinished_orders().await.unwrap(), vec!["26"]);
    }

    #[actix_web::test]
    async fn test_wall_clock_cap_stops_polling() {
        let client = Arc::new(ScriptedClient::default().script("34", vec![Ok(AccrualReply::NotReady)]));
        let policy = RetryPolicy {
            max_attempts: 100,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            max_elapsed: Duration::from_millis(50),
            ..fast_policy()
        };
        let harness = Harness::new(client.clone(), policy).await;
        harness.submit("34").await;

        let err = harness.process("34").await.unwrap_err();
        assert!(matches!(err, PollError::Exhausted { .. }));
        assert!(client.calls() < 10);
    }

    #[actix_web::test]
    async fn test_unexpected_status_is_not_retried() {
        let client = Arc::new(ScriptedClient::default().script("42", vec![Err(AccrualError::UnexpectedStatus(404))]));
        let harness = Harness::new(client.clone(), fast_policy()).await;
        harness.submit("42").await;

        let err = harness.process("42").await.unwrap_err();
        assert!(matches!(err, PollError::Rejected { .. }));
        assert_eq!(client.calls(), 1);
    }

    #[actix_web::test]
    async fn test_processed_without_accrual_credits_nothing() {
        let client = Arc::new(ScriptedClient::default().script("59", vec![verdict("59", AccrualStatus::Processed, None)]));
        let harness = Harness::new(client, fast_policy()).await;
        harness.submit("59").await;

        harness.process("59").await.unwrap();
        let order = harness.store.get_by_number("59").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(amount("0")));
        assert_eq!(harness.balance().await, amount("0"));
    }

    #[actix_web::test]
    async fn test_verdict_for_another_order_is_not_committed() {
        let client = Arc::new(ScriptedClient::default().script(
            "83",
            vec![verdict("91", AccrualStatus::Processed, Some("1000"))],
        ));
        let harness = Harness::new(client, fast_policy()).await;
        harness.submit("83").await;
        harness.submit("91").await;

        let err = harness.process("83").await.unwrap_err();
        assert!(matches!(err, PollError::Rejected { .. }), "{err}");
        assert_eq!(
            harness.store.get_by_number("83").await.unwrap().status,
            OrderStatus::Processing
        );
        assert_eq!(harness.store.get_by_number("91").await.unwrap().status, OrderStatus::New);
        assert_eq!(harness.balance().await, amount("0"));
    }

    #[actix_web::test]
    async fn test_missing_balance_is_reported_as_credit_failure() {
        let client = Arc::new(ScriptedClient::default().script("67", vec![verdict("67", AccrualStatus::Processed, Some("10"))]));
        let harness = Harness::new(client, fast_policy()).await;
        harness.store.create_order("67", UserId(2)).await.unwrap();

        let err = harness.process("67").await.unwrap_err();
        assert!(matches!(err, PollError::CreditFailed { owner: UserId(2), .. }));
        // the status write stays, reconciliation picks up the difference
        assert_eq!(
            harness.store.get_by_number("67").await.unwrap().status,
            OrderStatus::Processed
        );
    }

    #[actix_web::test]
    async fn test_shutdown_aborts_retry_wait() {
        let client = Arc::new(ScriptedClient::default().script("75", vec![Ok(AccrualReply::NotReady)]));
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
            ..fast_policy()
        };
        let harness = Harness::new(client, policy).await;
        harness.submit("75").await;

        let mut shutdown = harness.shutdown();
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            harness.shutdown_tx.send(true).unwrap();
        };
        let (result, _) = tokio::time::timeout(
            Duration::from_secs(2),
            futures::future::join(harness.poller.process("75", &mut shutdown), stop),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PollError::Aborted { .. })));
        assert_eq!(
            harness.store.get_by_number("75").await.unwrap().status,
            OrderStatus::Processing
        );
    }

    #[actix_web::test]
    async fn test_worker_moves_past_failed_orders() {
        let client = Arc::new(
            ScriptedClient::default()
                .script("83", vec![Err(AccrualError::UnexpectedStatus(404))])
                .script("91", vec![verdict("91", AccrualStatus::Processed, Some("7.5"))]),
        );
        let mut harness = Harness::new(client, fast_policy()).await;
        harness.submit("83").await;
        harness.submit("91").await;
        // never submitted, the ledger lookup fails
        harness.queue.enqueue("109");
        harness.queue.enqueue("83");
        harness.queue.enqueue("91");

        let worker = actix_web::rt::spawn(harness.poller.clone().run(0, harness.shutdown()));

        let first = tokio::time::timeout(Duration::from_secs(2), harness.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, PollError::Store { .. }));
        let second = tokio::time::timeout(Duration::from_secs(2), harness.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, PollError::Rejected { .. }));

        for _ in 0..100 {
            if harness.balance().await == amount("7.5") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.balance().await, amount("7.5"));

        harness.queue.close();
        tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn test_panic_is_isolated() {
        let mut harness = Harness::new(Arc::new(PanickingClient), fast_policy()).await;
        harness.submit("18").await;
        harness.queue.enqueue("18");

        let worker = actix_web::rt::spawn(harness.poller.clone().run(0, harness.shutdown()));
        let reported = tokio::time::timeout(Duration::from_secs(2), harness.errors.recv())
            .await
            .unwrap()
            .unwrap();
        match reported {
            PollError::Panicked { number, message } => {
                assert_eq!(number, "18");
                assert!(message.contains("exploded"));
            }
            other => panic!("unexpected error {other}"),
        }
        // the lease was released with the panic
        assert!(!harness.queue.is_claimed("18"));

        harness.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    }
}
