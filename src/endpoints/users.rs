//! Handles management of staff and admin accounts

use actix_web::{
    get, post,
    web::{self, Data, Json, Query},
    HttpRequest, HttpResponse,
};
use serde::Deserialize;

use crate::{
    auth,
    config::Config,
    db::{Database, UserParams},
    endpoints::util::Pagination,
    error::Error,
    models::{Department, Role, User, UserProfile},
};

/// configure all user endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(me).service(create_user).service(list_users);
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub department: Option<Department>,
    #[serde(default)]
    pub tag_id: Option<String>,
}

async fn __create_user(
    body: CreateUserRequest,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    if body.username.trim().is_empty() || body.name.trim().is_empty() {
        return Err(Error::InvalidInput(
            "username and name must be non-empty".into(),
        ));
    }
    if body.password.is_empty() {
        return Err(Error::InvalidInput("password must be non-empty".into()));
    }
    if body.role == Role::Staff && body.department.is_none() {
        return Err(Error::InvalidInput(
            "staff accounts must be assigned a department".into(),
        ));
    }

    let hashed_password = auth::hash_password(&body.password)?;
    let user = db
        .create_user(UserParams {
            username: body.username,
            hashed_password,
            name: body.name,
            role: body.role,
            department: body.department,
            tag_id: body.tag_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(UserProfile::from(user)))
}

async fn __list_users(
    page: Pagination,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    let (skip, limit) = page.clamped();
    let users = db.list_users(skip, limit).await?;
    let profiles: Vec<UserProfile> = users.into_iter().map(UserProfile::from).collect();
    Ok(HttpResponse::Ok().json(profiles))
}

/// endpoint which returns the authenticated account's own profile
/// (GET /users/me)
#[get("/users/me")]
async fn me(
    req: HttpRequest,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let user = auth::bearer_user(&req, &db, &config.token_secret).await?;
    Ok(HttpResponse::Ok().json(UserProfile::from(user)))
}

/// endpoint which creates a new staff or admin account (POST /users)
#[post("/users")]
async fn create_user(
    req: HttpRequest,
    body: Json<CreateUserRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __create_user(body.into_inner(), acting, &db).await
}

/// endpoint which lists accounts with pagination (GET /users)
#[get("/users")]
async fn list_users(
    req: HttpRequest,
    page: Query<Pagination>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __list_users(page.into_inner(), acting, &db).await
}
