use std::collections::HashMap;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::error::StoreError;
use crate::models::{BalanceSnapshot, BalanceSummary, Order, OrderStatus, User, UserId, Withdrawal};

pub mod memory;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Inserts a NEW order. Fails with `StoreError::Duplicate` when the number is taken.
    async fn create_order(&self, number: &str, owner: UserId) -> Result<Order>;

    async fn get_by_number(&self, number: &str) -> Result<Order>;

    /// Moves the order to `status`, storing `accrual` when it becomes PROCESSED,
    /// and returns its owner. Transitions out of a terminal status are rejected
    /// with `StoreError::IllegalTransition`.
    async fn update_order(&self, number: &str, status: OrderStatus, accrual: Option<BigDecimal>) -> Result<UserId>;

    /// All orders of a user, oldest upload first, ties broken by insertion order.
    async fn get_orders_by_user(&self, owner: UserId) -> Result<Vec<Order>>;

    /// Numbers of NEW and PROCESSING orders, oldest upload first.
    async fn unfinished_orders(&self) -> Result<Vec<String>>;

    /// Sum of accruals of PROCESSED orders, per owner.
    async fn processed_totals(&self) -> Result<HashMap<UserId, BigDecimal>>;
}

#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn create_balance(&self, owner: UserId) -> Result<()>;

    async fn credit_balance(&self, owner: UserId, amount: &BigDecimal) -> Result<()>;

    /// Debits `amount` and records the withdrawal in one transaction.
    /// Returns `Ok(false)` without touching anything when funds are insufficient.
    async fn withdraw(&self, owner: UserId, order: &str, amount: &BigDecimal) -> Result<bool>;

    async fn get_sum_and_withdrawals(&self, owner: UserId) -> Result<BalanceSummary>;

    /// Withdrawal history, oldest first.
    async fn get_withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>>;

    async fn snapshots(&self) -> Result<Vec<BalanceSnapshot>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Creates the user and its zero balance together, neither exists after a failure.
    /// Fails with `StoreError::Duplicate` when the login is taken.
    async fn register(&self, login: &str, password_hash: &str) -> Result<User>;

    async fn find_by_login(&self, login: &str) -> Result<Option<User>>;

    async fn create_session(&self, token: &str, user: UserId) -> Result<()>;

    async fn user_by_session(&self, token: &str) -> Result<Option<UserId>>;
}
