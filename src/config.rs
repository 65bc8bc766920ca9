use std::time::Duration;

use clap::Parser;

use crate::accrual::queue::OverflowPolicy;
use crate::accrual::retry::RetryPolicy;

/// Command line flags win over environment variables, which win over defaults.
#[derive(Debug, Clone, Parser)]
#[command(name = "gophermart", version, about = "Loyalty points accrual and balance service")]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(short = 'a', long = "address", env = "RUN_ADDRESS", default_value = "127.0.0.1:8080")]
    pub address: String,

    /// PostgreSQL connection string
    #[arg(short = 'd', long, env = "DATABASE_URI", required_unless_present = "in_memory")]
    pub database_uri: Option<String>,

    /// Base URL of the accrual service
    #[arg(
        short = 'r',
        long,
        env = "ACCRUAL_SYSTEM_ADDRESS",
        default_value = "http://127.0.0.1:8081"
    )]
    pub accrual_system_address: String,

    /// Keep everything in process memory instead of PostgreSQL
    #[arg(long, env = "IN_MEMORY")]
    pub in_memory: bool,

    #[arg(long, env = "ACCRUAL_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    #[arg(long, env = "ACCRUAL_QUEUE_OVERFLOW", value_enum, default_value_t = OverflowPolicy::Reject)]
    pub queue_overflow: OverflowPolicy,

    #[arg(long, env = "ACCRUAL_POLLER_WORKERS", default_value_t = 1)]
    pub poller_workers: usize,

    /// Requests per order and polling cycle, the first one included
    #[arg(long, env = "ACCRUAL_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(long, env = "ACCRUAL_RETRY_INITIAL_DELAY_MS", default_value_t = 1000)]
    pub retry_initial_delay_ms: u64,

    #[arg(long, env = "ACCRUAL_RETRY_MAX_DELAY_MS", default_value_t = 5000)]
    pub retry_max_delay_ms: u64,

    #[arg(long, env = "ACCRUAL_RETRY_MAX_ELAPSED_SECS", default_value_t = 30)]
    pub retry_max_elapsed_secs: u64,

    #[arg(long, env = "ACCRUAL_REQUEST_TIMEOUT_MS", default_value_t = 3000)]
    pub accrual_timeout_ms: u64,

    /// How often unfinished orders are requeued and balances reconciled
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_initial_delay_ms)),
            max_elapsed: Duration::from_secs(self.retry_max_elapsed_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn accrual_timeout(&self) -> Duration {
        Duration::from_millis(self.accrual_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
