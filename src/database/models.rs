use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::error::StoreError;
use crate::models::{self as domain, OrderStatus, UserId};

#[derive(Queryable)]
pub struct Balance {
    pub user_id: i64,
    pub current: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable)]
pub struct Order {
    pub id: i64,
    pub number: String,
    pub user_id: i64,
    pub status: String,
    pub accrual: Option<BigDecimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl TryFrom<Order> for domain::Order {
    type Error = StoreError;

    fn try_from(row: Order) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OrderStatus>()
            .map_err(|e| StoreError::Corrupt(format!("order {}: {e}", row.number)))?;
        Ok(domain::Order {
            number: row.number,
            owner: UserId(row.user_id),
            status,
            accrual: row.accrual,
            uploaded_at: row.uploaded_at,
        })
    }
}

#[derive(Queryable)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub order_number: String,
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
}

impl From<Withdrawal> for domain::Withdrawal {
    fn from(row: Withdrawal) -> Self {
        domain::Withdrawal {
            owner: UserId(row.user_id),
            order: row.order_number,
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Queryable)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for domain::User {
    fn from(row: User) -> Self {
        domain::User {
            id: UserId(row.id),
            login: row.login,
            password_hash: row.password_hash,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder<'a> {
    pub id: i64,
    pub number: &'a str,
    pub user_id: i64,
    pub status: &'a str,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::withdrawals)]
pub struct NewWithdrawal<'a> {
    pub id: i64,
    pub user_id: i64,
    pub order_number: &'a str,
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser<'a> {
    pub id: i64,
    pub login: &'a str,
    pub password_hash: &'a str,
    pub created_at: DateTime<Utc>,
}
