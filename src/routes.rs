use actix_request_identifier::RequestId;
use actix_web::{get, post, web, HttpResponse};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::accrual::queue::Enqueued;
use crate::auth::{self, AuthenticatedUser};
use crate::error::{AppError, StoreError};
use crate::ledger::{BalanceLedger, OrderLedger, UserStore};
use crate::state::AppState;
use crate::{luhn, money, responses};

#[derive(Deserialize)]
struct Credentials {
    login: String,
    password: String,
}

#[derive(Deserialize)]
struct WithdrawInput {
    order: String,
    #[serde(with = "crate::money")]
    sum: BigDecimal,
}

fn parse_credentials(body: &[u8]) -> Result<Credentials, AppError> {
    let credentials: Credentials =
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("malformed credentials: {e}")))?;
    if credentials.login.is_empty() || credentials.password.is_empty() {
        return Err(AppError::BadRequest("login and password are required".into()));
    }
    Ok(credentials)
}

fn check_order_number(number: &str) -> Result<(), AppError> {
    if !luhn::is_numeric(number) || !luhn::is_valid(number) {
        return Err(AppError::InvalidOrderNumber(number.to_string()));
    }
    Ok(())
}

#[post("/api/user/register")]
#[instrument(skip(state, body), fields(request_id = request_id.as_str()))]
pub async fn register_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let credentials = parse_credentials(&body)?;
    let hash = auth::hash_password(credentials.password, state.password_cost).await?;
    let user = match state.users.register(&credentials.login, &hash).await {
        Ok(user) => user,
        Err(StoreError::Duplicate { .. }) => {
            return Err(AppError::Conflict(format!("login {} is taken", credentials.login)))
        }
        Err(e) => return Err(e.into()),
    };
    info!(user = %user.id, "user registered");
    auth::start_session(&state, user.id).await
}

#[post("/api/user/login")]
#[instrument(skip(state, body), fields(request_id = request_id.as_str()))]
pub async fn login_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let credentials = parse_credentials(&body)?;
    let user = state
        .users
        .find_by_login(&credentials.login)
        .await?
        .ok_or(AppError::Unauthorized)?;
    if !auth::verify_password(credentials.password, user.password_hash).await? {
        return Err(AppError::Unauthorized);
    }
    auth::start_session(&state, user.id).await
}

#[post("/api/user/orders")]
#[instrument(skip(state, body), fields(request_id = request_id.as_str(), user_id = %user.0))]
pub async fn submit_order_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    user: AuthenticatedUser,
    body: String,
) -> Result<HttpResponse, AppError> {
    let number = body.trim();
    if number.is_empty() {
        return Err(AppError::BadRequest("order number is required".into()));
    }
    check_order_number(number)?;

    match state.orders.create_order(number, user.0).await {
        Ok(_) => {}
        Err(StoreError::Duplicate { .. }) => {
            let existing = state.orders.get_by_number(number).await?;
            if existing.owner == user.0 {
                return Ok(HttpResponse::Ok().finish());
            }
            return Err(AppError::Conflict(format!("order {number} belongs to another user")));
        }
        Err(e) => return Err(e.into()),
    }

    match state.queue.enqueue(number) {
        Enqueued::Accepted | Enqueued::AlreadyClaimed => {}
        Enqueued::Displaced(dropped) => {
            warn!(order = %dropped, "accrual queue full, order displaced until the next sweep")
        }
        Enqueued::Rejected => warn!(order = number, "accrual queue full, order left for the next sweep"),
        Enqueued::Closed => warn!(order = number, "accrual queue closed, order left for the next sweep"),
    }
    info!(order = number, "order accepted");
    Ok(HttpResponse::Accepted().finish())
}

#[get("/api/user/orders")]
#[instrument(skip(state), fields(request_id = request_id.as_str(), user_id = %user.0))]
pub async fn orders_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let orders = state.orders.get_orders_by_user(user.0).await?;
    Ok(responses::orders_http_response(orders))
}

#[get("/api/user/balance")]
#[instrument(skip(state), fields(request_id = request_id.as_str(), user_id = %user.0))]
pub async fn balance_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let balance = state.balances.get_sum_and_withdrawals(user.0).await?;
    Ok(responses::balance_http_response(balance))
}

#[post("/api/user/balance/withdraw")]
#[instrument(skip(state, body), fields(request_id = request_id.as_str(), user_id = %user.0))]
pub async fn withdraw_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    user: AuthenticatedUser,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let input: WithdrawInput =
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("malformed withdrawal: {e}")))?;
    check_order_number(&input.order)?;
    let sum = money::normalize(input.sum);
    if !money::is_positive(&sum) {
        return Err(AppError::InvalidAmount(sum.to_string()));
    }

    if !state.balances.withdraw(user.0, &input.order, &sum).await? {
        return Ok(HttpResponse::PaymentRequired().body("insufficient funds"));
    }
    info!(order = %input.order, %sum, "withdrawal approved");
    Ok(HttpResponse::Ok().finish())
}

#[get("/api/user/withdrawals")]
#[instrument(skip(state), fields(request_id = request_id.as_str(), user_id = %user.0))]
pub async fn withdrawals_handler(
    state: web::Data<AppState>,
    request_id: RequestId,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let withdrawals = state.balances.get_withdrawals(user.0).await?;
    Ok(responses::withdrawals_http_response(withdrawals))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register_handler)
        .service(login_handler)
        .service(submit_order_handler)
        .service(orders_handler)
        .service(balance_handler)
        .service(withdraw_handler)
        .service(withdrawals_handler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::queue::{AccrualQueue, OverflowPolicy};
    use crate::ledger;
    use crate::ledger::memory::MemoryStore;
    use crate::models::{User, UserId};
    use actix_request_identifier::RequestIdentifier;
    use actix_web::cookie::Cookie;
    use actix_web::dev::ServiceResponse;
    use actix_web::http::header::AUTHORIZATION;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn test_state(store: &MemoryStore) -> web::Data<AppState> {
        let queue = Arc::new(AccrualQueue::new(16, OverflowPolicy::Reject));
        web::Data::new(AppState::new(store.clone(), queue, 4))
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .wrap(RequestIdentifier::with_uuid())
                    .app_data($state)
                    .configure(configure),
            )
            .await
        };
    }

    fn register_request(login: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/user/register")
            .set_json(json!({"login": login, "password": "hunter2"}))
    }

    fn bearer(resp: &ServiceResponse) -> String {
        assert_eq!(resp.status(), StatusCode::OK);
        resp.headers()
            .get(AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn user_id(store: &MemoryStore, login: &str) -> UserId {
        store.find_by_login(login).await.unwrap().unwrap().id
    }

    fn amount(v: &str) -> BigDecimal {
        BigDecimal::from_str(v).unwrap()
    }

    #[actix_web::test]
    async fn test_register_and_login() {
        let store = MemoryStore::new();
        let app = test_app!(test_state(&store));

        let resp = test::call_service(&app, register_request("alice").to_request()).await;
        assert!(bearer(&resp).starts_with("Bearer "));
        assert!(resp.response().cookies().any(|c| c.name() == auth::SESSION_COOKIE));

        // the balance exists from the start
        let id = user_id(&store, "alice").await;
        assert_eq!(store.get_sum_and_withdrawals(id).await.unwrap().current, amount("0"));

        let req = test::TestRequest::post()
            .uri("/api/user/register")
            .set_json(json!({"login": "alice", "password": "other"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/api/user/register")
            .set_payload("{\"login\": ")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/user/login")
            .set_json(json!({"login": "alice", "password": "wrong"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/api/user/login")
            .set_json(json!({"login": "nobody", "password": "hunter2"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/api/user/login")
            .set_json(json!({"login": "alice", "password": "hunter2"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    // the first registration fails inside the store, as a failed balance insert would
    struct FailingOnceUsers {
        inner: MemoryStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl UserStore for FailingOnceUsers {
        async fn register(&self, login: &str, password_hash: &str) -> ledger::Result<User> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Corrupt("balance insert failed".to_string()));
            }
            self.inner.register(login, password_hash).await
        }

        async fn find_by_login(&self, login: &str) -> ledger::Result<Option<User>> {
            self.inner.find_by_login(login).await
        }

        async fn create_session(&self, token: &str, user: UserId) -> ledger::Result<()> {
            self.inner.create_session(token, user).await
        }

        async fn user_by_session(&self, token: &str) -> ledger::Result<Option<UserId>> {
            self.inner.user_by_session(token).await
        }
    }

    #[actix_web::test]
    async fn test_failed_registration_can_be_retried() {
        let store = MemoryStore::new();
        let state = web::Data::new(AppState {
            orders: Arc::new(store.clone()),
            balances: Arc::new(store.clone()),
            users: Arc::new(FailingOnceUsers {
                inner: store.clone(),
                failed: AtomicBool::new(false),
            }),
            queue: Arc::new(AccrualQueue::new(16, OverflowPolicy::Reject)),
            password_cost: 4,
        });
        let app = test_app!(state);

        let resp = test::call_service(&app, register_request("alice").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(store.find_by_login("alice").await.unwrap().is_none());
        assert!(store.snapshots().await.unwrap().is_empty());

        let token = bearer(&test::call_service(&app, register_request("alice").to_request()).await);

        let req = test::TestRequest::post()
            .uri("/api/user/login")
            .set_json(json!({"login": "alice", "password": "hunter2"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri("/api/user/balance")
            .insert_header((AUTHORIZATION, token))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"current": 0.0, "withdrawn": 0.0}));
    }

    #[actix_web::test]
    async fn test_endpoints_require_session() {
        let store = MemoryStore::new();
        let app = test_app!(test_state(&store));

        for req in [
            test::TestRequest::get().uri("/api/user/orders"),
            test::TestRequest::get().uri("/api/user/balance"),
            test::TestRequest::get().uri("/api/user/withdrawals"),
            test::TestRequest::post().uri("/api/user/orders").set_payload("79927398713"),
            test::TestRequest::get()
                .uri("/api/user/balance")
                .insert_header((AUTHORIZATION, "Bearer unknown")),
        ] {
            let resp = test::call_service(&app, req.to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[actix_web::test]
    async fn test_submit_orders() {
        let store = MemoryStore::new();
        let state = test_state(&store);
        let app = test_app!(state.clone());
        let alice = bearer(&test::call_service(&app, register_request("alice").to_request()).await);
        let bob = bearer(&test::call_service(&app, register_request("bob").to_request()).await);

        let submit = |token: &str, body: &str| {
            test::TestRequest::post()
                .uri("/api/user/orders")
                .insert_header((AUTHORIZATION, token.to_string()))
                .set_payload(body.to_string())
                .to_request()
        };

        let resp = test::call_service(&app, submit(&alice, "79927398713")).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(state.queue.is_claimed("79927398713"));

        let resp = test::call_service(&app, submit(&alice, "79927398713")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = test::call_service(&app, submit(&bob, "79927398713")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = test::call_service(&app, submit(&alice, "")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = test::call_service(&app, submit(&alice, "79927398710")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = test::call_service(&app, submit(&alice, "7992-7398713")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = test::call_service(&app, submit(&alice, "18")).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::get()
            .uri("/api/user/orders")
            .insert_header((AUTHORIZATION, alice.clone()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["number"], "79927398713");
        assert_eq!(listed[0]["status"], "NEW");
        assert!(listed[0].get("accrual").is_none());
        assert!(listed[0]["uploaded_at"].is_string());
        assert_eq!(listed[1]["number"], "18");

        let req = test::TestRequest::get()
            .uri("/api/user/orders")
            .insert_header((AUTHORIZATION, bob))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    }

    #[actix_web::test]
    async fn test_balance_and_withdrawals() {
        let store = MemoryStore::new();
        let app = test_app!(test_state(&store));
        let token = bearer(&test::call_service(&app, register_request("alice").to_request()).await);
        let id = user_id(&store, "alice").await;
        store.credit_balance(id, &amount("500")).await.unwrap();

        let withdraw = |body: serde_json::Value| {
            test::TestRequest::post()
                .uri("/api/user/balance/withdraw")
                .insert_header((AUTHORIZATION, token.clone()))
                .set_json(body)
                .to_request()
        };

        let req = test::TestRequest::get()
            .uri("/api/user/withdrawals")
            .insert_header((AUTHORIZATION, token.clone()))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let resp = test::call_service(&app, withdraw(json!({"order": "2377225624", "sum": 500}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = test::call_service(&app, withdraw(json!({"order": "2377225624", "sum": 1}))).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        let resp = test::call_service(&app, withdraw(json!({"order": "2377225625", "sum": 1}))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = test::call_service(&app, withdraw(json!({"order": "2377225624", "sum": 0}))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = test::call_service(&app, withdraw(json!({"order": "2377225624", "sum": -5}))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = test::call_service(&app, withdraw(json!({"order": "2377225624"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/user/balance")
            .cookie(Cookie::new(auth::SESSION_COOKIE, token.trim_start_matches("Bearer ").to_string()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"current": 0.0, "withdrawn": 500.0}));

        let req = test::TestRequest::get()
            .uri("/api/user/withdrawals")
            .insert_header((AUTHORIZATION, token.clone()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["order"], "2377225624");
        assert_eq!(listed[0]["sum"], json!(500.0));
        assert!(listed[0]["processed_at"].is_string());
    }

    #[actix_web::test]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let store = MemoryStore::new();
        let app = test_app!(test_state(&store));
        let token = bearer(&test::call_service(&app, register_request("alice").to_request()).await);
        let id = user_id(&store, "alice").await;
        store.credit_balance(id, &amount("100")).await.unwrap();

        let withdraw = |order: &str| {
            test::TestRequest::post()
                .uri("/api/user/balance/withdraw")
                .insert_header((AUTHORIZATION, token.clone()))
                .set_json(json!({"order": order, "sum": 80}))
                .to_request()
        };
        let (first, second) = futures::join!(
            test::call_service(&app, withdraw("2377225624")),
            test::call_service(&app, withdraw("79927398713"))
        );
        let mut statuses = vec![first.status().as_u16(), second.status().as_u16()];
        statuses.sort();
        assert_eq!(statuses, vec![200, 402]);

        let balance = store.get_sum_and_withdrawals(id).await.unwrap();
        assert_eq!(balance.current, amount("20"));
        assert_eq!(balance.withdrawn, amount("80"));
    }
}
