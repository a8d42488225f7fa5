//! Handles credential exchange for staff and admin accounts

use actix_web::{
    post,
    web::{self, Data},
    HttpResponse,
};
use serde::{Deserialize, Serialize};

use crate::{auth, config::Config, db::Database, error::Error};

/// configure the token endpoint service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(token);
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse<'r> {
    access_token: &'r str,
    token_type: &'static str,
}

async fn __token(
    form: TokenRequest,
    db: &Database,
    config: &Config,
) -> Result<HttpResponse, Error> {
    let user = db
        .user_by_username(&form.username)
        .await?
        .filter(|u| u.is_active)
        .filter(|u| auth::verify_password(&form.password, &u.hashed_password))
        .ok_or_else(|| Error::Unauthorized("incorrect username or password".into()))?;

    let access_token = auth::create_access_token(
        &user.username,
        user.role,
        &config.token_secret,
        config.token_ttl_minutes,
    )?;
    Ok(HttpResponse::Ok().json(TokenResponse {
        access_token: &access_token,
        token_type: "bearer",
    }))
}

/// endpoint which exchanges a username and password for a bearer token
/// (POST /token)
#[post("/token")]
async fn token(
    form: web::Form<TokenRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    __token(form.into_inner(), &db, &config).await
}
