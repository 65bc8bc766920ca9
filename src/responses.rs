use actix_web::HttpResponse;
use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::models::{BalanceSummary, Order, OrderStatus, Withdrawal};

#[derive(Debug, Serialize)]
pub struct OrderData {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none", with = "crate::money::option")]
    pub accrual: Option<BigDecimal>,
    pub uploaded_at: String,
}

#[derive(Debug, Serialize)]
pub struct BalanceData {
    #[serde(with = "crate::money")]
    pub current: BigDecimal,
    #[serde(with = "crate::money")]
    pub withdrawn: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalData {
    pub order: String,
    #[serde(with = "crate::money")]
    pub sum: BigDecimal,
    pub processed_at: String,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn orders_http_response(orders: Vec<Order>) -> HttpResponse {
    if orders.is_empty() {
        return HttpResponse::NoContent().finish();
    }
    let data: Vec<OrderData> = orders
        .into_iter()
        .map(|order| OrderData {
            uploaded_at: timestamp(&order.uploaded_at),
            number: order.number,
            status: order.status,
            // only a PROCESSED order has earned anything
            accrual: match order.status {
                OrderStatus::Processed => order.accrual,
                _ => None,
            },
        })
        .collect();
    HttpResponse::Ok().json(data)
}

pub fn balance_http_response(balance: BalanceSummary) -> HttpResponse {
    HttpResponse::Ok().json(BalanceData {
        current: balance.current,
        withdrawn: balance.withdrawn,
    })
}

pub fn withdrawals_http_response(withdrawals: Vec<Withdrawal>) -> HttpResponse {
    if withdrawals.is_empty() {
        return HttpResponse::NoContent().finish();
    }
    let data: Vec<WithdrawalData> = withdrawals
        .into_iter()
        .map(|w| WithdrawalData {
            processed_at: timestamp(&w.created_at),
            order: w.order,
            sum: w.amount,
        })
        .collect();
    HttpResponse::Ok().json(data)
}
