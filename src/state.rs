use std::sync::Arc;

use crate::accrual::queue::AccrualQueue;
use crate::ledger::{BalanceLedger, OrderLedger, UserStore};

/// Shared by all HTTP workers through `web::Data`.
pub struct AppState {
    pub orders: Arc<dyn OrderLedger>,
    pub balances: Arc<dyn BalanceLedger>,
    pub users: Arc<dyn UserStore>,
    pub queue: Arc<AccrualQueue>,
    pub password_cost: u32,
}

impl AppState {
    pub fn new<S>(store: S, queue: Arc<AccrualQueue>, password_cost: u32) -> Self
    where
        S: OrderLedger + BalanceLedger + UserStore + Clone + 'static,
    {
        Self {
            orders: Arc::new(store.clone()),
            balances: Arc::new(store.clone()),
            users: Arc::new(store),
            queue,
            password_cost,
        }
    }
}
