//! Handles the device read path: resolving a scanned tag to the identity
//! holding it

use actix_web::{
    post,
    web::{self, Data, Json},
    HttpRequest, HttpResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    db::Database,
    endpoints::util::student_clearance_detail,
    error::Error,
    models::{ClearanceDetail, Device, Principal, UserProfile},
};

/// configure the scan endpoint service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(scan);
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub tag_id: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScanResponse {
    Student { clearance: ClearanceDetail },
    StaffAdmin { profile: UserProfile },
}

async fn __scan(body: ScanRequest, device: Device, db: &Database) -> Result<HttpResponse, Error> {
    if body.tag_id.trim().is_empty() {
        return Err(Error::InvalidInput("tag_id must be non-empty".into()));
    }
    db.touch_device(device.id).await?;

    let principal = match db.resolve_tag(&body.tag_id).await? {
        Some(principal) => principal,
        None => {
            db.append_device_log(
                Some(device.id),
                Some(body.tag_id.clone()),
                "FETCH_FAIL: tag not recognised".into(),
            )
            .await?;
            return Err(Error::NotFound(format!(
                "tag '{}' is not linked to any identity",
                body.tag_id
            )));
        }
    };

    match principal {
        Principal::Student(student) => {
            db.append_device_log(
                Some(device.id),
                Some(body.tag_id.clone()),
                format!("FETCH_SUCCESS: student '{}'", student.student_id),
            )
            .await?;
            let clearance = student_clearance_detail(db, student).await?;
            Ok(HttpResponse::Ok().json(ScanResponse::Student { clearance }))
        }
        Principal::StaffAdmin(user) => {
            db.append_device_log(
                Some(device.id),
                Some(body.tag_id.clone()),
                format!("FETCH_SUCCESS: user '{}'", user.username),
            )
            .await?;
            Ok(HttpResponse::Ok().json(ScanResponse::StaffAdmin {
                profile: UserProfile::from(user),
            }))
        }
    }
}

/// endpoint through which a device resolves a scanned tag to a student's
/// clearance detail or a staff profile (POST /scan)
#[post("/scan")]
async fn scan(
    req: HttpRequest,
    body: Json<ScanRequest>,
    db: Data<Database>,
) -> Result<HttpResponse, Error> {
    let device = auth::device_from_request(&req, &db).await?;
    __scan(body.into_inner(), device, &db).await
}
