use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{BalanceLedger, OrderLedger, Result, UserStore};
use crate::error::StoreError;
use crate::models::{BalanceSnapshot, BalanceSummary, Order, OrderStatus, User, UserId, Withdrawal};
use crate::money;

#[derive(Default)]
struct State {
    // insertion order doubles as the tiebreaker for equal timestamps
    orders: Vec<Order>,
    order_index: HashMap<String, usize>,
    balances: HashMap<UserId, BigDecimal>,
    withdrawals: Vec<Withdrawal>,
    users: HashMap<String, User>,
    sessions: HashMap<String, UserId>,
}

/// A process-local store behind a single lock.
///
/// Holding the write lock across each read-modify-write gives the same
/// per-user serialization the database gets from row locks.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    next_user_id: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderLedger for MemoryStore {
    async fn create_order(&self, number: &str, owner: UserId) -> Result<Order> {
        let mut state = self.state.write().await;
        if state.order_index.contains_key(number) {
            return Err(StoreError::duplicate("order", number));
        }
        let order = Order {
            number: number.to_string(),
            owner,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at: Utc::now(),
        };
        let idx = state.orders.len();
        state.orders.push(order.clone());
        state.order_index.insert(number.to_string(), idx);
        Ok(order)
    }

    async fn get_by_number(&self, number: &str) -> Result<Order> {
        let state = self.state.read().await;
        state
            .order_index
            .get(number)
            .map(|idx| state.orders[*idx].clone())
            .ok_or_else(|| StoreError::not_found("order", number))
    }

    async fn update_order(&self, number: &str, status: OrderStatus, accrual: Option<BigDecimal>) -> Result<UserId> {
        let mut state = self.state.write().await;
        let idx = *state
            .order_index
            .get(number)
            .ok_or_else(|| StoreError::not_found("order", number))?;
        let order = &mut state.orders[idx];
        if !order.status.can_become(status) {
            return Err(StoreError::IllegalTransition {
                number: number.to_string(),
                from: order.status,
                to: status,
            });
        }
        order.status = status;
        if status == OrderStatus::Processed {
            order.accrual = Some(accrual.map(money::normalize).unwrap_or_else(money::zero));
        }
        Ok(order.owner)
    }

    async fn get_orders_by_user(&self, owner: UserId) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state.orders.iter().filter(|o| o.owner == owner).cloned().collect();
        // stable sort keeps insertion order for equal timestamps
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn unfinished_orders(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut orders: Vec<&Order> = state.orders.iter().filter(|o| !o.status.is_terminal()).collect();
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders.into_iter().map(|o| o.number.clone()).collect())
    }

    async fn processed_totals(&self) -> Result<HashMap<UserId, BigDecimal>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::Processed)
            .fold(HashMap::new(), |mut acc, o| {
                let total = acc.entry(o.owner).or_insert_with(money::zero);
                *total += o.accrual.clone().unwrap_or_else(money::zero);
                acc
            }))
    }
}

#[async_trait]
impl BalanceLedger for MemoryStore {
    async fn create_balance(&self, owner: UserId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.balances.contains_key(&owner) {
            return Err(StoreError::duplicate("balance", owner));
        }
        state.balances.insert(owner, money::zero());
        Ok(())
    }

    async fn credit_balance(&self, owner: UserId, amount: &BigDecimal) -> Result<()> {
        let mut state = self.state.write().await;
        let current = state
            .balances
            .get_mut(&owner)
            .ok_or_else(|| StoreError::not_found("balance", owner))?;
        *current = money::normalize(current.clone() + amount);
        Ok(())
    }

    async fn withdraw(&self, owner: UserId, order: &str, amount: &BigDecimal) -> Result<bool> {
        let mut state = self.state.write().await;
        let current = state
            .balances
            .get(&owner)
            .cloned()
            .ok_or_else(|| StoreError::not_found("balance", owner))?;
        let after = money::normalize(current - amount);
        if after < money::zero() {
            return Ok(false);
        }
        state.balances.insert(owner, after);
        state.withdrawals.push(Withdrawal {
            owner,
            order: order.to_string(),
            amount: money::normalize(amount.clone()),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn get_sum_and_withdrawals(&self, owner: UserId) -> Result<BalanceSummary> {
        let state = self.state.read().await;
        let current = state
            .balances
            .get(&owner)
            .cloned()
            .ok_or_else(|| StoreError::not_found("balance", owner))?;
        let withdrawn = state
            .withdrawals
            .iter()
            .filter(|w| w.owner == owner)
            .fold(money::zero(), |acc, w| acc + &w.amount);
        Ok(BalanceSummary { current, withdrawn })
    }

    async fn get_withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>> {
        let state = self.state.read().await;
        Ok(state.withdrawals.iter().filter(|w| w.owner == owner).cloned().collect())
    }

    async fn snapshots(&self) -> Result<Vec<BalanceSnapshot>> {
        let state = self.state.read().await;
        let mut snapshots: Vec<BalanceSnapshot> = state
            .balances
            .iter()
            .map(|(owner, current)| BalanceSnapshot {
                owner: *owner,
                current: current.clone(),
                withdrawn: state
                    .withdrawals
                    .iter()
                    .filter(|w| w.owner == *owner)
                    .fold(money::zero(), |acc, w| acc + &w.amount),
            })
            .collect();
        snapshots.sort_by_key(|s| s.owner);
        Ok(snapshots)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn register(&self, login: &str, password_hash: &str) -> Result<User> {
        let mut state = self.state.write().await;
        if state.users.contains_key(login) {
            return Err(StoreError::duplicate("user", login));
        }
        let id = UserId(self.next_user_id.fetch_add(1, Ordering::SeqCst) + 1);
        if state.balances.contains_key(&id) {
            return Err(StoreError::duplicate("balance", id));
        }
        let user = User {
            id,
            login: login.to_string(),
            password_hash: password_hash.to_string(),
        };
        state.users.insert(login.to_string(), user.clone());
        state.balances.insert(id, money::zero());
        Ok(user)
    }

    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(login).cloned())
    }

    async fn create_session(&self, token: &str, user: UserId) -> Result<()> {
        self.state.write().await.sessions.insert(token.to_string(), user);
        Ok(())
    }

    async fn user_by_session(&self, token: &str) -> Result<Option<UserId>> {
        Ok(self.state.read().await.sessions.get(token).copied())
    }
}
