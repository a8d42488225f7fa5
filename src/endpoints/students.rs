//! Handles registration and lookup of students being cleared

use actix_web::{
    delete, get, post,
    web::{self, Data, Json, Path, Query},
    HttpRequest, HttpResponse,
};
use serde::Deserialize;

use crate::{
    auth,
    config::Config,
    db::{Database, StudentParams},
    endpoints::util::{student_clearance_detail, Pagination},
    error::Error,
    models::User,
};

/// configure all student endpoint services
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(create_student)
        .service(list_students)
        .service(get_student)
        .service(delete_student);
}

#[derive(Debug, Deserialize)]
pub struct CreateStudentRequest {
    pub student_id: String,
    pub name: String,
    pub department: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tag_id: Option<String>,
}

async fn __create_student(body: CreateStudentRequest, db: &Database) -> Result<HttpResponse, Error> {
    if body.student_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err(Error::InvalidInput(
            "student_id and name must be non-empty".into(),
        ));
    }
    let student = db
        .create_student(StudentParams {
            student_id: body.student_id,
            name: body.name,
            department: body.department,
            email: body.email,
            tag_id: body.tag_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(student))
}

async fn __delete_student(
    student_id: &str,
    acting: User,
    db: &Database,
) -> Result<HttpResponse, Error> {
    auth::require_admin(&acting)?;
    db.delete_student(student_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// endpoint which registers a new student and seeds their clearance records
/// (POST /students)
#[post("/students")]
async fn create_student(
    req: HttpRequest,
    body: Json<CreateStudentRequest>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    // any authenticated staff/admin may register students
    auth::bearer_user(&req, &db, &config.token_secret).await?;
    __create_student(body.into_inner(), &db).await
}

/// endpoint which lists students with pagination (GET /students)
#[get("/students")]
async fn list_students(
    req: HttpRequest,
    page: Query<Pagination>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    auth::bearer_user(&req, &db, &config.token_secret).await?;
    let (skip, limit) = page.clamped();
    let students = db.list_students(skip, limit).await?;
    Ok(HttpResponse::Ok().json(students))
}

/// endpoint which returns one student's full clearance detail
/// (GET /students/{student_id})
#[get("/students/{student_id}")]
async fn get_student(
    req: HttpRequest,
    student_id: Path<String>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    auth::bearer_user(&req, &db, &config.token_secret).await?;
    let student_id = student_id.into_inner();
    let student = db
        .student_by_student_id(&student_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student with id '{}' not found", student_id)))?;
    let detail = student_clearance_detail(&db, student).await?;
    Ok(HttpResponse::Ok().json(detail))
}

/// endpoint which removes a student and their clearance records
/// (DELETE /students/{student_id})
#[delete("/students/{student_id}")]
async fn delete_student(
    req: HttpRequest,
    student_id: Path<String>,
    db: Data<Database>,
    config: Data<Config>,
) -> Result<HttpResponse, Error> {
    let acting = auth::bearer_user(&req, &db, &config.token_secret).await?;
    __delete_student(&student_id.into_inner(), acting, &db).await
}
