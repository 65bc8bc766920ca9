use actix_web::cookie::{time, Cookie};
use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest, HttpResponse};
use futures::future::LocalBoxFuture;

use crate::error::AppError;
use crate::ledger::UserStore;
use crate::models::UserId;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "gophermart-auth-cookie";

const SESSION_DAYS: i64 = 365;

/// The caller of an authenticated endpoint. Extracting it fails with 401
/// when the request carries no known session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let token = session_token(req);
        let state = req.app_data::<web::Data<AppState>>().cloned();
        Box::pin(async move {
            let state = state.ok_or_else(|| AppError::Internal(anyhow::anyhow!("application state is missing")))?;
            let token = token.ok_or(AppError::Unauthorized)?;
            state
                .users
                .user_by_session(&token)
                .await?
                .map(AuthenticatedUser)
                .ok_or(AppError::Unauthorized)
        })
    }
}

fn session_token(req: &HttpRequest) -> Option<String> {
    if let Some(cookie) = req.cookie(SESSION_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

// bcrypt is slow on purpose, keep it off the async workers
pub async fn hash_password(password: String, cost: u32) -> Result<String, AppError> {
    web::block(move || bcrypt::hash(password, cost))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| AppError::Internal(e.into()))
}

pub async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    web::block(move || bcrypt::verify(password, &hash))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| AppError::Internal(e.into()))
}

pub fn new_session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Opens a session for `user` and answers with its token.
pub async fn start_session(state: &AppState, user: UserId) -> Result<HttpResponse, AppError> {
    let token = new_session_token();
    state.users.create_session(&token, user).await?;
    let cookie = Cookie::build(SESSION_COOKIE, token.clone())
        .path("/")
        .http_only(true)
        .max_age(time::Duration::days(SESSION_DAYS))
        .finish();
    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .insert_header((AUTHORIZATION, format!("Bearer {token}")))
        .finish())
}
