//! Typed entities for every table, the enums they embed, and the small pure
//! computations that operate on them.

use crate::schema::{
    clearance_records, device_logs, devices, pending_tag_links, students, users,
};
use chrono::NaiveDateTime;
use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

/// Implements the sqlite `Text` mapping for an enum that provides
/// `as_str`/`parse_str`.
macro_rules! text_backed {
    ($t:ty) => {
        impl ToSql<Text, Sqlite> for $t {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(self.as_str());
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Sqlite> for $t {
            fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
                Self::parse_str(&raw)
                    .ok_or_else(|| format!("unrecognised value in database: {}", raw).into())
            }
        }
    };
}

/// Role of a dashboard account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Unrestricted access to every department
    Admin,
    /// Scoped to exactly one department
    Staff,
}

impl Role {
    /// The wire/storage form of this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
        }
    }

    /// Parse the wire/storage form
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

text_backed!(Role);

/// A department a student must obtain clearance from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "UPPERCASE")]
pub enum Department {
    /// The student's own academic department
    Department,
    /// Bursary / fees
    Bursary,
    /// Library returns
    Library,
    /// Alumni registration
    Alumni,
}

impl Department {
    /// Every department a student must clear, in seeding order
    pub const ALL: [Department; 4] = [
        Department::Department,
        Department::Bursary,
        Department::Library,
        Department::Alumni,
    ];

    /// The wire/storage form of this department
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::Department => "DEPARTMENT",
            Department::Bursary => "BURSARY",
            Department::Library => "LIBRARY",
            Department::Alumni => "ALUMNI",
        }
    }

    /// Parse the wire/storage form
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "DEPARTMENT" => Some(Department::Department),
            "BURSARY" => Some(Department::Bursary),
            "LIBRARY" => Some(Department::Library),
            "ALUMNI" => Some(Department::Alumni),
            _ => None,
        }
    }
}

text_backed!(Department);

/// Per-department clearance state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum ClearanceStatus {
    /// Initial state, nothing submitted yet
    NotCompleted,
    /// Submitted, awaiting a decision
    Pending,
    /// Cleared by the department
    Completed,
    /// Rejected by the department
    Rejected,
}

impl ClearanceStatus {
    /// The wire/storage form of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearanceStatus::NotCompleted => "not_completed",
            ClearanceStatus::Pending => "pending",
            ClearanceStatus::Completed => "completed",
            ClearanceStatus::Rejected => "rejected",
        }
    }

    /// Parse the wire/storage form
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "not_completed" => Some(ClearanceStatus::NotCompleted),
            "pending" => Some(ClearanceStatus::Pending),
            "completed" => Some(ClearanceStatus::Completed),
            "rejected" => Some(ClearanceStatus::Rejected),
            _ => None,
        }
    }
}

text_backed!(ClearanceStatus);

/// Which identity table a pending tag link targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// The target identifier is a student id
    Student,
    /// The target identifier is a staff/admin username
    StaffAdmin,
}

impl TargetKind {
    /// The wire/storage form of this target kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Student => "student",
            TargetKind::StaffAdmin => "staff_admin",
        }
    }

    /// Parse the wire/storage form
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "student" => Some(TargetKind::Student),
            "staff_admin" => Some(TargetKind::StaffAdmin),
            _ => None,
        }
    }
}

text_backed!(TargetKind);

/// Aggregate clearance state across all departments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// At least one department is outstanding (or no records exist at all)
    Pending,
    /// Every department has signed off
    Completed,
}

/// Aggregate a student's records into one overall state.
///
/// An empty record set is `Pending`: a student with no records has not been
/// cleared, however they came to have none.
pub fn overall_status(records: &[ClearanceRecord]) -> OverallStatus {
    if !records.is_empty()
        && records
            .iter()
            .all(|r| r.status == ClearanceStatus::Completed)
    {
        OverallStatus::Completed
    } else {
        OverallStatus::Pending
    }
}

/// A staff or admin account.
#[derive(Debug, Clone, Queryable)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub hashed_password: String,
    pub name: String,
    pub role: Role,
    pub department: Option<Department>,
    pub is_active: bool,
    pub tag_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub hashed_password: String,
    pub name: String,
    pub role: Role,
    pub department: Option<Department>,
    pub is_active: bool,
    pub tag_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A student being cleared.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct Student {
    pub id: i32,
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub email: Option<String>,
    pub tag_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = students)]
pub struct NewStudent {
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub email: Option<String>,
    pub tag_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One (student, department) clearance row.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct ClearanceRecord {
    pub id: i32,
    pub student_id: String,
    pub department: Department,
    pub status: ClearanceStatus,
    pub remarks: Option<String>,
    pub cleared_by: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = clearance_records)]
pub struct NewClearanceRecord {
    pub student_id: String,
    pub department: Department,
    pub status: ClearanceStatus,
    pub remarks: Option<String>,
    pub cleared_by: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A registered scanning device.
#[derive(Debug, Clone, Queryable, Serialize)]
pub struct Device {
    pub id: i32,
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
    pub api_key: String,
    pub is_active: bool,
    pub last_seen: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = devices)]
pub struct NewDevice {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
    pub api_key: String,
    pub is_active: bool,
    pub last_seen: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A short-lived intent binding one device to one target identity, awaiting
/// a tag scan.
#[derive(Debug, Clone, Queryable)]
pub struct PendingTagLink {
    pub id: i32,
    pub device_id: i32,
    pub target_kind: TargetKind,
    pub target_identifier: String,
    pub initiated_by: i32,
    pub expires_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = pending_tag_links)]
pub struct NewPendingTagLink {
    pub device_id: i32,
    pub target_kind: TargetKind,
    pub target_identifier: String,
    pub initiated_by: i32,
    pub expires_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

/// An audit entry for a device action, success or failure.
#[derive(Debug, Clone, Queryable)]
pub struct DeviceLog {
    pub id: i32,
    pub device_id: Option<i32>,
    pub tag_id: Option<String>,
    pub action: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = device_logs)]
pub struct NewDeviceLog {
    pub device_id: Option<i32>,
    pub tag_id: Option<String>,
    pub action: String,
    pub created_at: NaiveDateTime,
}

/// Whichever identity a tag resolved to. Students get clearance detail,
/// staff/admin only a profile.
#[derive(Debug, Clone)]
pub enum Principal {
    Student(Student),
    StaffAdmin(User),
}

/// A user profile as exposed over the wire. Never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i32,
    pub username: String,
    pub name: String,
    pub role: Role,
    pub department: Option<Department>,
    pub is_active: bool,
    pub tag_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<User> for UserProfile {
    fn from(u: User) -> Self {
        UserProfile {
            id: u.id,
            username: u.username,
            name: u.name,
            role: u.role,
            department: u.department,
            is_active: u.is_active,
            tag_id: u.tag_id,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// One department line in a clearance detail response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceItem {
    pub department: Department,
    pub status: ClearanceStatus,
    pub remarks: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl From<ClearanceRecord> for ClearanceItem {
    fn from(r: ClearanceRecord) -> Self {
        ClearanceItem {
            department: r.department,
            status: r.status,
            remarks: r.remarks,
            updated_at: r.updated_at,
        }
    }
}

/// Full clearance state of one student, as returned by the detail routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceDetail {
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub overall_status: OverallStatus,
    pub clearance_items: Vec<ClearanceItem>,
}
