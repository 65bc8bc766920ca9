use snowflake::SnowflakeIdGenerator;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

// 2024-03-01T00:00:00Z
const LEDGER_EPOCH_MS: u64 = 1709251200000;

static GENERATOR: once_cell::sync::Lazy<Mutex<SnowflakeIdGenerator>> = once_cell::sync::Lazy::new(|| {
    let epoch = UNIX_EPOCH + Duration::from_millis(LEDGER_EPOCH_MS);
    Mutex::new(SnowflakeIdGenerator::with_epoch(
        fastrand::i32(0..32),
        fastrand::i32(0..32),
        epoch,
    ))
});

// row ids grow with insertion time within one process, which is what the
// ascending listings use to break timestamp ties
pub fn next_row_id() -> i64 {
    let mut generator = GENERATOR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    generator.generate()
}
