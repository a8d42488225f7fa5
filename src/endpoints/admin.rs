//! Handles the admin-only management surface: initiating tag links,
//! pre-registering devices, and deleting accounts, devices, and tag links

use actix_web::{
    delete, post,
    web::{self, Data, Json, Path},
    HttpRequest, HttpResponse,
};
use chrono::NaiveDateTime;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    config::Config,
    db::{Database, DeviceParams},
    error::Error,
    models::{TargetKind, User},
};

/// configure all admin endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(prepare_tag_link)
        .service(create_device)
        .service(delete_user)
        .service(delete_device)
        .service(unlink_tag);
}

#[derive(Debug, Deserialize)]
pub struct PrepareTagLinkRequest {
    pub device_identifier: String,
    pub target_user_type: TargetKind,
    pub target_identifier: String,
}

#[derive(Debug, Serialize)]
struct PrepareTagLinkResponse<'r> {
    device_identifier: &'r str,
    target_user_type: &'r str,
    target_identifier: &'r str,
    expires_at: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
struct UnlinkTagResponse<'r> {
    target_kind: &'r str,
    target_identifier: &'r str,
}

async fn __prepare_tag_link(
    body: PrepareTagLinkRequest,
    acting: User,
    config: &Config,
    db: &Database,
) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    let link = db
        .prepare_tag_link(
            &body.device_identifier,
            body.target_user_type,
            &body.target_identifier,
            acting.id,
            config.link_ttl_seconds,
        )
        .await?;
    info!(
        "tag link prepared on device {} for {} '{}'",
        body.device_identifier,
        link.target_kind.as_str(),
        link.target_identifier
    );
    Ok(HttpResponse::Accepted().json(PrepareTagLinkResponse {
        device_identifier: &body.device_identifier,
        target_user_type: link.target_kind.as_str(),
        target_identifier: &link.target_identifier,
        expires_at: link.expires_at,
    }))
}

async fn __create_device(
    body: CreateDeviceRequest,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    if body.device_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err(Error::InvalidInput(
            "device_id and name must be non-empty".into(),
        ));
    }
    let device = db
        .register_device_admin(DeviceParams {
            device_id: body.device_id,
            name: body.name,
            location: body.location,
        })
        .await?;
    Ok(HttpResponse::Created().json(device))
}

/// endpoint which creates a short-lived link intent binding a device's next
/// scan to a target identity (POST /admin/prepare-tag-link)
#[post("/admin/prepare-tag-link")]
async fn prepare_tag_link(
    req: HttpRequest,
    body: Json<PrepareTagLinkRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __prepare_tag_link(body.into_inner(), acting, &config, &db).await
}

/// endpoint which pre-registers a device on an admin's behalf
/// (POST /admin/devices)
#[post("/admin/devices")]
async fn create_device(
    req: HttpRequest,
    body: Json<CreateDeviceRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __create_device(body.into_inner(), acting, &db).await
}

/// endpoint which deletes a staff/admin account (DELETE /admin/users/{username})
#[delete("/admin/users/{username}")]
async fn delete_user(
    req: HttpRequest,
    username: Path<String>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    auth::require_admin(&acting)?;
    db.delete_user(&username.into_inner(), &acting).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// endpoint which deletes a device along with its logs and pending links
/// (DELETE /admin/devices/{device_id})
#[delete("/admin/devices/{device_id}")]
async fn delete_device(
    req: HttpRequest,
    device_id: Path<String>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    auth::require_admin(&acting)?;
    db.delete_device(&device_id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// endpoint which unlinks a tag from whichever identity holds it
/// (DELETE /admin/tags/{tag_id})
#[delete("/admin/tags/{tag_id}")]
async fn unlink_tag(
    req: HttpRequest,
    tag_id: Path<String>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    auth::require_admin(&acting)?;
    let (kind, identifier) = db.unlink_tag(&tag_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(UnlinkTagResponse {
        target_kind: kind.as_str(),
        target_identifier: &identifier,
    }))
}

#[cfg(test)]
mod test {
    use super::{PrepareTagLinkRequest, __prepare_tag_link};
    use crate::config::Config;
    use crate::db::tests::{student_params, test_db, user_params};
    use crate::error::Error;
    use crate::models::{Department, Role, TargetKind};
    use std::net::TcpListener;

    fn test_config() -> Config {
        Config {
            listener: TcpListener::bind(("127.0.0.1", 0)).unwrap(),
            db_url: String::new(),
            token_secret: "test-secret".into(),
            token_ttl_minutes: 30,
            link_ttl_seconds: 120,
            bootstrap_admin: None,
        }
    }

    #[tokio::test]
    async fn staff_cannot_prepare_tag_links() {
        let (db, path) = test_db("admin-prepare-role").await;
        let config = test_config();
        let staff = db
            .create_user(user_params("staff", Role::Staff, Some(Department::Library)))
            .await
            .unwrap();
        db.create_student(student_params("CS/20/001")).await.unwrap();
        db.register_device_self("RFID-READER-01", None).await.unwrap();

        let err = __prepare_tag_link(
            PrepareTagLinkRequest {
                device_identifier: "RFID-READER-01".into(),
                target_user_type: TargetKind::Student,
                target_identifier: "CS/20/001".into(),
            },
            staff,
            &config,
            &db,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn prepare_is_accepted_with_an_expiry() {
        let (db, path) = test_db("admin-prepare-accepted").await;
        let config = test_config();
        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        db.create_student(student_params("CS/20/002")).await.unwrap();
        db.register_device_self("RFID-READER-02", None).await.unwrap();

        let resp = __prepare_tag_link(
            PrepareTagLinkRequest {
                device_identifier: "RFID-READER-02".into(),
                target_user_type: TargetKind::Student,
                target_identifier: "CS/20/002".into(),
            },
            admin,
            &config,
            &db,
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), actix_web::http::StatusCode::ACCEPTED);

        std::fs::remove_file(path).unwrap();
    }
}
