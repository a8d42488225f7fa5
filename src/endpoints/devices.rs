//! Handles registration of scanning devices and the device half of the
//! tag-link flow

use actix_web::{
    get, post,
    web::{self, Data, Json},
    HttpRequest, HttpResponse,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    config::Config,
    db::Database,
    error::Error,
    models::{Device, User},
};

/// configure all device endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register_device)
        .service(submit_scanned_tag)
        .service(list_devices);
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterDeviceResponse<'r> {
    device_id: &'r str,
    location: Option<&'r str>,
    api_key: &'r str,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTagRequest {
    pub scanned_tag_id: String,
}

#[derive(Debug, Serialize)]
struct SubmitTagResponse<'r> {
    target_kind: &'r str,
    target_identifier: &'r str,
    message: &'static str,
}

async fn __register_device(
    body: RegisterDeviceRequest,
    db: &Database,
) -> Result<HttpResponse, Error> {
    if body.device_id.trim().is_empty() {
        return Err(Error::InvalidInput("device_id must be non-empty".into()));
    }
    let device = db
        .register_device_self(&body.device_id, body.location)
        .await?;
    info!("device {} registered", device.device_id);
    Ok(HttpResponse::Created().json(RegisterDeviceResponse {
        device_id: &device.device_id,
        location: device.location.as_deref(),
        api_key: &device.api_key,
    }))
}

async fn __submit_scanned_tag(
    body: SubmitTagRequest,
    device: Device,
    db: &Database,
) -> Result<HttpResponse, Error> {
    if body.scanned_tag_id.trim().is_empty() {
        return Err(Error::InvalidInput("scanned_tag_id must be non-empty".into()));
    }
    let (kind, identifier) = db.submit_scanned_tag(&device, &body.scanned_tag_id).await?;
    Ok(HttpResponse::Ok().json(SubmitTagResponse {
        target_kind: kind.as_str(),
        target_identifier: &identifier,
        message: "tag linked",
    }))
}

async fn __list_devices(acting: User, db: &Database) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    let devices = db.list_devices().await?;
    Ok(HttpResponse::Ok().json(devices))
}

/// endpoint through which a device registers itself and receives its
/// credential; re-registration rotates the credential (POST /devices/register)
#[post("/devices/register")]
async fn register_device(
    body: Json<RegisterDeviceRequest>,
    db: Data<Database>,
) -> Result<HttpResponse, Error> {
    __register_device(body.into_inner(), &db).await
}

/// endpoint through which a device reports the tag it scanned to complete a
/// pending link (POST /devices/submit-scanned-tag)
#[post("/devices/submit-scanned-tag")]
async fn submit_scanned_tag(
    req: HttpRequest,
    body: Json<SubmitTagRequest>,
    db: Data<Database>,
) -> Result<HttpResponse, Error> {
    let device = auth::device_from_request(&req, &db).await?;
    __submit_scanned_tag(body.into_inner(), device, &db).await
}

/// endpoint which lists every registered device (GET /devices)
#[get("/devices")]
async fn list_devices(
    req: HttpRequest,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __list_devices(acting, &db).await
}
