use std::collections::HashMap;

use bigdecimal::BigDecimal;
use diesel::{ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, RunQueryDsl};

use crate::database::models;
use crate::error::StoreError;
use crate::models::{self as domain, BalanceSnapshot, BalanceSummary, OrderStatus, UserId};
use crate::money;

pub fn load_order(conn: &mut PgConnection, req_number: &str) -> Result<domain::Order, StoreError> {
    use crate::schema::orders::dsl::*;
    orders
        .filter(number.eq(req_number))
        .first::<models::Order>(conn)
        .optional()?
        .ok_or_else(|| StoreError::not_found("order", req_number))?
        .try_into()
}

pub fn load_user_orders(conn: &mut PgConnection, owner: UserId) -> Result<Vec<domain::Order>, StoreError> {
    use crate::schema::orders::dsl::*;
    orders
        .filter(user_id.eq(owner.0))
        .order((uploaded_at.asc(), id.asc()))
        .load::<models::Order>(conn)?
        .into_iter()
        .map(domain::Order::try_from)
        .collect()
}

pub fn load_unfinished_numbers(conn: &mut PgConnection) -> Result<Vec<String>, StoreError> {
    use crate::schema::orders::dsl::*;
    let numbers = orders
        .filter(status.eq_any(vec![OrderStatus::New.as_str(), OrderStatus::Processing.as_str()]))
        .order((uploaded_at.asc(), id.asc()))
        .select(number)
        .load::<String>(conn)?;
    Ok(numbers)
}

pub fn load_processed_totals(conn: &mut PgConnection) -> Result<HashMap<UserId, BigDecimal>, StoreError> {
    use crate::schema::orders::dsl::*;
    let rows = orders
        .filter(status.eq(OrderStatus::Processed.as_str()))
        .select((user_id, accrual))
        .load::<(i64, Option<BigDecimal>)>(conn)?;
    Ok(rows.into_iter().fold(HashMap::new(), |mut acc, (owner, value)| {
        let total = acc.entry(UserId(owner)).or_insert_with(money::zero);
        *total += value.unwrap_or_else(money::zero);
        acc
    }))
}

fn withdrawn_total(conn: &mut PgConnection, owner: UserId) -> Result<BigDecimal, StoreError> {
    use crate::schema::withdrawals::dsl::*;
    let total = withdrawals
        .filter(user_id.eq(owner.0))
        .select(diesel::dsl::sum(amount))
        .first::<Option<BigDecimal>>(conn)?;
    Ok(total.unwrap_or_else(money::zero))
}

pub fn load_balance(conn: &mut PgConnection, owner: UserId) -> Result<BalanceSummary, StoreError> {
    let balance = {
        use crate::schema::balances::dsl::*;
        balances
            .filter(user_id.eq(owner.0))
            .first::<models::Balance>(conn)
            .optional()?
            .ok_or_else(|| StoreError::not_found("balance", owner))?
    };
    let withdrawn = withdrawn_total(conn, owner)?;
    Ok(BalanceSummary {
        current: balance.current,
        withdrawn,
    })
}

pub fn load_withdrawals(conn: &mut PgConnection, owner: UserId) -> Result<Vec<domain::Withdrawal>, StoreError> {
    use crate::schema::withdrawals::dsl::*;
    let rows = withdrawals
        .filter(user_id.eq(owner.0))
        .order((created_at.asc(), id.asc()))
        .load::<models::Withdrawal>(conn)?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub fn load_balance_snapshots(conn: &mut PgConnection) -> Result<Vec<BalanceSnapshot>, StoreError> {
    let balances = {
        use crate::schema::balances::dsl::*;
        balances.order(user_id.asc()).load::<models::Balance>(conn)?
    };
    let withdrawn = {
        use crate::schema::withdrawals::dsl::*;
        withdrawals
            .select((user_id, amount))
            .load::<(i64, BigDecimal)>(conn)?
            .into_iter()
            .fold(HashMap::new(), |mut acc: HashMap<i64, BigDecimal>, (owner, value)| {
                *acc.entry(owner).or_insert_with(money::zero) += value;
                acc
            })
    };
    Ok(balances
        .into_iter()
        .map(|balance| BalanceSnapshot {
            owner: UserId(balance.user_id),
            withdrawn: withdrawn.get(&balance.user_id).cloned().unwrap_or_else(money::zero),
            current: balance.current,
        })
        .collect())
}

pub fn load_user_by_login(conn: &mut PgConnection, req_login: &str) -> Result<Option<domain::User>, StoreError> {
    use crate::schema::users::dsl::*;
    let user = users
        .filter(login.eq(req_login))
        .first::<models::User>(conn)
        .optional()?;
    Ok(user.map(Into::into))
}

pub fn load_session_user(conn: &mut PgConnection, req_token: &str) -> Result<Option<UserId>, StoreError> {
    use crate::schema::sessions::dsl::*;
    let owner = sessions
        .filter(token.eq(req_token))
        .select(user_id)
        .first::<i64>(conn)
        .optional()?;
    Ok(owner.map(UserId))
}
