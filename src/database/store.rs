use std::collections::HashMap;
use std::ops::DerefMut;

use actix_web::web;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::PgConnection;

use crate::database::connect::PgPool;
use crate::database::{mutations, queries};
use crate::ledger::{BalanceLedger, OrderLedger, Result, UserStore};
use crate::models::{BalanceSnapshot, BalanceSummary, Order, OrderStatus, User, UserId, Withdrawal};

/// Ledger ports backed by PostgreSQL.
///
/// diesel is synchronous, so every call checks a connection out of the pool
/// and runs on actix's blocking thread pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        web::block(move || {
            let mut conn = pool.get()?;
            f(conn.deref_mut())
        })
        .await?
    }
}

#[async_trait]
impl OrderLedger for PgStore {
    async fn create_order(&self, number: &str, owner: UserId) -> Result<Order> {
        let number = number.to_string();
        self.run(move |conn| mutations::create_order(conn, &number, owner)).await
    }

    async fn get_by_number(&self, number: &str) -> Result<Order> {
        let number = number.to_string();
        self.run(move |conn| queries::load_order(conn, &number)).await
    }

    async fn update_order(&self, number: &str, status: OrderStatus, accrual: Option<BigDecimal>) -> Result<UserId> {
        let number = number.to_string();
        self.run(move |conn| mutations::update_order(conn, &number, status, accrual))
            .await
    }

    async fn get_orders_by_user(&self, owner: UserId) -> Result<Vec<Order>> {
        self.run(move |conn| queries::load_user_orders(conn, owner)).await
    }

    async fn unfinished_orders(&self) -> Result<Vec<String>> {
        self.run(queries::load_unfinished_numbers).await
    }

    async fn processed_totals(&self) -> Result<HashMap<UserId, BigDecimal>> {
        self.run(queries::load_processed_totals).await
    }
}

#[async_trait]
impl BalanceLedger for PgStore {
    async fn create_balance(&self, owner: UserId) -> Result<()> {
        self.run(move |conn| mutations::create_balance(conn, owner)).await
    }

    async fn credit_balance(&self, owner: UserId, amount: &BigDecimal) -> Result<()> {
        let amount = amount.clone();
        self.run(move |conn| mutations::credit_balance(conn, owner, &amount)).await
    }

    async fn withdraw(&self, owner: UserId, order: &str, amount: &BigDecimal) -> Result<bool> {
        let order = order.to_string();
        let amount = amount.clone();
        self.run(move |conn| mutations::withdraw(conn, owner, &order, &amount))
            .await
    }

    async fn get_sum_and_withdrawals(&self, owner: UserId) -> Result<BalanceSummary> {
        self.run(move |conn| queries::load_balance(conn, owner)).await
    }

    async fn get_withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>> {
        self.run(move |conn| queries::load_withdrawals(conn, owner)).await
    }

    async fn snapshots(&self) -> Result<Vec<BalanceSnapshot>> {
        self.run(queries::load_balance_snapshots).await
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn register(&self, login: &str, password_hash: &str) -> Result<User> {
        let login = login.to_string();
        let password_hash = password_hash.to_string();
        self.run(move |conn| mutations::register_user(conn, &login, &password_hash))
            .await
    }

    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        let login = login.to_string();
        self.run(move |conn| queries::load_user_by_login(conn, &login)).await
    }

    async fn create_session(&self, token: &str, user: UserId) -> Result<()> {
        let token = token.to_string();
        self.run(move |conn| mutations::create_session(conn, &token, user)).await
    }

    async fn user_by_session(&self, token: &str) -> Result<Option<UserId>> {
        let token = token.to_string();
        self.run(move |conn| queries::load_session_user(conn, &token)).await
    }
}
