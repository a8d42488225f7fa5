//! Handles the clearance ledger: per-department status updates, resets, and
//! the kiosk-style self lookup by tag

use actix_web::{
    delete, get, put,
    web::{self, Data, Json, Path},
    HttpRequest, HttpResponse,
};
use serde::Deserialize;

use crate::{
    auth,
    config::Config,
    db::Database,
    endpoints::util::student_clearance_detail,
    error::Error,
    models::{ClearanceItem, ClearanceStatus, Department, Principal, User},
};

/// configure all clearance endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(update_clearance)
        .service(reset_clearance)
        .service(my_clearance);
}

#[derive(Debug, Deserialize)]
pub struct UpdateClearanceRequest {
    pub student_id: String,
    pub department: Department,
    pub status: ClearanceStatus,
    #[serde(default)]
    pub remarks: Option<String>,
}

async fn __update_clearance(
    body: UpdateClearanceRequest,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    if !auth::verify_department_access(&acting, body.department) {
        return Err(Error::Forbidden(format!(
            "not permitted to act for the {} department",
            body.department.as_str()
        )));
    }
    let record = db
        .upsert_clearance(
            &body.student_id,
            body.department,
            body.status,
            body.remarks,
            acting.id,
        )
        .await?;
    Ok(HttpResponse::Ok().json(ClearanceItem::from(record)))
}

async fn __reset_clearance(
    student_id: &str,
    department_raw: &str,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    let department = Department::parse_str(department_raw).ok_or_else(|| {
        Error::InvalidInput(format!("'{}' is not a known department", department_raw))
    })?;
    if !auth::verify_department_access(&acting, department) {
        return Err(Error::Forbidden(format!(
            "not permitted to act for the {} department",
            department.as_str()
        )));
    }
    db.reset_clearance(student_id, department).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn __my_clearance(principal: Principal, db: &Database) -> Result<HttpResponse, Error> {
    match principal {
        Principal::Student(student) => {
            let detail = student_clearance_detail(db, student).await?;
            Ok(HttpResponse::Ok().json(detail))
        }
        // staff/admin tags have no clearance records to show
        Principal::StaffAdmin(_) => Err(Error::Forbidden(
            "clearance lookup is only available to student tags".into(),
        )),
    }
}

/// endpoint which sets one (student, department) clearance status
/// (PUT /clearance)
#[put("/clearance")]
async fn update_clearance(
    req: HttpRequest,
    body: Json<UpdateClearanceRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __update_clearance(body.into_inner(), acting, &db).await
}

/// endpoint which deletes one (student, department) record, returning that
/// department to its default state (DELETE /clearance/{student_id}/{department})
#[delete("/clearance/{student_id}/{department}")]
async fn reset_clearance(
    req: HttpRequest,
    path: Path<(String, String)>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    let (student_id, department) = path.into_inner();
    __reset_clearance(&student_id, &department, acting, &db).await
}

/// endpoint which returns the clearance detail for whichever student's tag
/// is presented in the x-tag-id header (GET /clearance/me)
#[get("/clearance/me")]
async fn my_clearance(req: HttpRequest, db: Data<Database>) -> Result<HttpResponse, Error> {
    let principal = auth::tag_principal(&req, &db).await?;
    __my_clearance(principal, &db).await
}
