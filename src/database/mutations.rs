use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::{Connection, ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, RunQueryDsl};

use crate::database::models::{NewOrder, NewUser, NewWithdrawal};
use crate::database::{idgen, models, queries};
use crate::error::StoreError;
use crate::models::{self as domain, OrderStatus, UserId};
use crate::money;

// inserts a NEW order, a taken number is reported as a duplicate
pub fn create_order(conn: &mut PgConnection, req_number: &str, owner: UserId) -> Result<domain::Order, StoreError> {
    let inserted = {
        use crate::schema::orders::dsl::*;
        diesel::insert_into(orders)
            .values(&NewOrder {
                id: idgen::next_row_id(),
                number: req_number,
                user_id: owner.0,
                status: OrderStatus::New.as_str(),
                uploaded_at: Utc::now(),
            })
            .on_conflict(number)
            .do_nothing()
            .execute(conn)?
    };
    if inserted == 0 {
        return Err(StoreError::duplicate("order", req_number));
    }
    queries::load_order(conn, req_number)
}

// moves an order forward, returns the owner
pub fn update_order(
    conn: &mut PgConnection,
    req_number: &str,
    req_status: OrderStatus,
    req_accrual: Option<BigDecimal>,
) -> Result<UserId, StoreError> {
    conn.transaction::<_, StoreError, _>(|conn| {
        // lock the order row so two workers cannot race the same transition
        let order = {
            use crate::schema::orders::dsl::*;
            orders
                .filter(number.eq(req_number))
                .for_update()
                .first::<models::Order>(conn)
                .optional()?
                .ok_or_else(|| StoreError::not_found("order", req_number))?
        };
        let order = domain::Order::try_from(order)?;
        if !order.status.can_become(req_status) {
            return Err(StoreError::IllegalTransition {
                number: req_number.to_string(),
                from: order.status,
                to: req_status,
            });
        }

        let new_accrual = if req_status == OrderStatus::Processed {
            Some(req_accrual.map(money::normalize).unwrap_or_else(money::zero))
        } else {
            None
        };
        {
            use crate::schema::orders::dsl::*;
            diesel::update(orders.filter(number.eq(req_number)))
                .set((status.eq(req_status.as_str()), accrual.eq(new_accrual)))
                .execute(conn)?;
        }
        Ok(order.owner)
    })
}

// creates the zero balance of a freshly registered user
pub fn create_balance(conn: &mut PgConnection, owner: UserId) -> Result<(), StoreError> {
    use crate::schema::balances::dsl::*;
    let now = Utc::now();
    let inserted = diesel::insert_into(balances)
        .values((
            user_id.eq(owner.0),
            current.eq(money::zero()),
            created_at.eq(now),
            updated_at.eq(now),
        ))
        .on_conflict(user_id)
        .do_nothing()
        .execute(conn)?;
    if inserted == 0 {
        return Err(StoreError::duplicate("balance", owner));
    }
    Ok(())
}

fn lock_balance(conn: &mut PgConnection, owner: UserId) -> Result<models::Balance, StoreError> {
    use crate::schema::balances::dsl::*;
    balances
        .filter(user_id.eq(owner.0))
        .for_update()
        .first::<models::Balance>(conn)
        .optional()?
        .ok_or_else(|| StoreError::not_found("balance", owner))
}

fn store_balance(conn: &mut PgConnection, owner: UserId, value: BigDecimal) -> Result<(), StoreError> {
    use crate::schema::balances::dsl::*;
    diesel::update(balances.filter(user_id.eq(owner.0)))
        .set((current.eq(value), updated_at.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}

pub fn credit_balance(conn: &mut PgConnection, owner: UserId, value: &BigDecimal) -> Result<(), StoreError> {
    conn.transaction::<_, StoreError, _>(|conn| {
        let balance = lock_balance(conn, owner)?;
        store_balance(conn, owner, money::normalize(balance.current + value))
    })
}

// debits the balance and records the withdrawal, Ok(false) when funds are short
pub fn withdraw(
    conn: &mut PgConnection,
    owner: UserId,
    req_order: &str,
    value: &BigDecimal,
) -> Result<bool, StoreError> {
    conn.transaction::<_, StoreError, _>(|conn| {
        let balance = lock_balance(conn, owner)?;
        let balance_after = money::normalize(balance.current - value);
        if balance_after < money::zero() {
            return Ok(false);
        }
        store_balance(conn, owner, balance_after)?;
        {
            use crate::schema::withdrawals::dsl::*;
            diesel::insert_into(withdrawals)
                .values(&NewWithdrawal {
                    id: idgen::next_row_id(),
                    user_id: owner.0,
                    order_number: req_order,
                    amount: money::normalize(value.clone()),
                    created_at: Utc::now(),
                })
                .execute(conn)?;
        }
        Ok(true)
    })
}

pub fn create_user(conn: &mut PgConnection, req_login: &str, req_password_hash: &str) -> Result<domain::User, StoreError> {
    let inserted = {
        use crate::schema::users::dsl::*;
        diesel::insert_into(users)
            .values(&NewUser {
                id: idgen::next_row_id(),
                login: req_login,
                password_hash: req_password_hash,
                created_at: Utc::now(),
            })
            .on_conflict(login)
            .do_nothing()
            .execute(conn)?
    };
    if inserted == 0 {
        return Err(StoreError::duplicate("user", req_login));
    }
    queries::load_user_by_login(conn, req_login)?.ok_or_else(|| StoreError::not_found("user", req_login))
}

// the user and its zero balance are inserted together or not at all
pub fn register_user(conn: &mut PgConnection, req_login: &str, req_password_hash: &str) -> Result<domain::User, StoreError> {
    conn.transaction::<_, StoreError, _>(|conn| {
        let user = create_user(conn, req_login, req_password_hash)?;
        create_balance(conn, user.id)?;
        Ok(user)
    })
}

pub fn create_session(conn: &mut PgConnection, req_token: &str, owner: UserId) -> Result<(), StoreError> {
    use crate::schema::sessions::dsl::*;
    diesel::insert_into(sessions)
        .values((token.eq(req_token), user_id.eq(owner.0), created_at.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}
