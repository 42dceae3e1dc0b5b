//! Current-user resolution.
//!
//! Session handling lives outside this service: the fronting gateway
//! authenticates the browser session and injects the resolved user id as the
//! `X-User-Id` header. This guard validates the header against the `users`
//! table so downstream handlers always work with a real identity.

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::Request;
use rocket::State;
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::request::OpenApiFromRequest;
use thiserror::Error;

const USER_ID_HEADER: &str = "X-User-Id";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing {USER_ID_HEADER} header")]
    MissingHeader,
    #[error("malformed {USER_ID_HEADER} header")]
    MalformedHeader,
    #[error("unknown user")]
    UnknownUser,
    #[error("identity lookup failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Config(String),
}

impl AuthError {
    fn status(&self) -> Status {
        match self {
            AuthError::Database(_) | AuthError::Config(_) => Status::InternalServerError,
            _ => Status::Unauthorized,
        }
    }
}

#[derive(Debug, Clone, OpenApiFromRequest)]
pub struct CurrentUser {
    pub id: i32,
    pub email: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CurrentUser {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match extract_user(request).await {
            Ok(user) => Outcome::Success(user),
            Err(err) => Outcome::Error((err.status(), err)),
        }
    }
}

async fn extract_user(request: &Request<'_>) -> Result<CurrentUser, AuthError> {
    let raw = request
        .headers()
        .get_one(USER_ID_HEADER)
        .ok_or(AuthError::MissingHeader)?;

    let user_id: i32 = raw.trim().parse().map_err(|_| AuthError::MalformedHeader)?;

    let pool = request
        .guard::<&State<PgPool>>()
        .await
        .succeeded()
        .ok_or_else(|| AuthError::Config("database pool missing from state".into()))?;

    let row: Option<(i32, String)> =
        sqlx::query_as("SELECT id, email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool.inner())
            .await?;

    let (id, email) = row.ok_or(AuthError::UnknownUser)?;

    Ok(CurrentUser { id, email })
}
