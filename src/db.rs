//! The store handle. All reads and writes go through [`Database`], which is
//! constructed once at startup and handed to every endpoint as shared state.
//!
//! Every check-then-write pair (tag uniqueness, one pending link per device,
//! student creation plus clearance seeding, cascading deletes) runs inside a
//! single `immediate_transaction`; the unique indexes in the schema are the
//! backstop against races, surfaced as `Conflict` by the error conversion.

use chrono::{Duration, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{info, warn};
use rand::{distributions::Alphanumeric, Rng};

use crate::error::Error;
use crate::models::{
    ClearanceRecord, ClearanceStatus, Department, Device, NewClearanceRecord, NewDevice,
    NewDeviceLog, NewPendingTagLink, NewStudent, NewUser, PendingTagLink, Principal, Role,
    Student, TargetKind, User,
};
use crate::schema::{clearance_records, device_logs, devices, pending_tag_links, students, users};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Request to create a staff/admin account. The password must already be
/// hashed by the caller.
#[derive(Debug)]
pub struct UserParams {
    pub username: String,
    pub hashed_password: String,
    pub name: String,
    pub role: Role,
    pub department: Option<Department>,
    pub tag_id: Option<String>,
}

/// Request to create a student.
#[derive(Debug)]
pub struct StudentParams {
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub email: Option<String>,
    pub tag_id: Option<String>,
}

/// Request to pre-register a device on behalf of an admin.
#[derive(Debug)]
pub struct DeviceParams {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
}

/// Outcome of a device submitting a scanned tag, used internally so the
/// transaction can commit its cleanup writes even when the operation fails.
enum SubmitOutcome {
    NoActiveLink,
    TagConflict(String),
    TargetMissing(String),
    Linked {
        kind: TargetKind,
        identifier: String,
    },
}

#[derive(Debug)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionOptions
{
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Shared handle over the sqlite store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open a connection pool over the given database url.
    pub fn new(db_url: &str) -> Result<Self, Error> {
        let manager = ConnectionManager::<SqliteConnection>::new(db_url);
        let pool = Pool::builder()
            .max_size(16)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| Error::Internal(format!("failed to build connection pool: {}", e)))?;
        Ok(Database { pool })
    }

    /// Run any pending migrations. Called once at startup.
    pub async fn init(&self) -> Result<(), Error> {
        self.interact(|conn| {
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| Error::Internal(format!("failed to run migrations: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// Run a blocking closure against a pooled connection on the blocking
    /// thread pool.
    async fn interact<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Identity store: users
    // ------------------------------------------------------------------

    /// Create a staff/admin account, rejecting duplicate usernames and
    /// already-linked tags.
    pub async fn create_user(&self, params: UserParams) -> Result<User, Error> {
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let existing = users::table
                    .filter(users::username.eq(&params.username))
                    .first::<User>(conn)
                    .optional()?;
                if existing.is_some() {
                    return Err(Error::Conflict(format!(
                        "username '{}' is already registered",
                        params.username
                    )));
                }
                if let Some(tag) = &params.tag_id {
                    if tag_holder(conn, tag)?.is_some() {
                        return Err(Error::Conflict(format!(
                            "tag '{}' is already linked to another identity",
                            tag
                        )));
                    }
                }
                let now = Utc::now().naive_utc();
                let user = diesel::insert_into(users::table)
                    .values(NewUser {
                        username: params.username,
                        hashed_password: params.hashed_password,
                        name: params.name,
                        role: params.role,
                        department: params.department,
                        is_active: true,
                        tag_id: params.tag_id,
                        created_at: now,
                        updated_at: now,
                    })
                    .get_result(conn)?;
                Ok(user)
            })
        })
        .await
    }

    /// Lookup a user by username.
    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>, Error> {
        let username = username.to_owned();
        self.interact(move |conn| {
            Ok(users::table
                .filter(users::username.eq(username))
                .first::<User>(conn)
                .optional()?)
        })
        .await
    }

    /// List users with pagination.
    pub async fn list_users(&self, skip: i64, limit: i64) -> Result<Vec<User>, Error> {
        self.interact(move |conn| {
            Ok(users::table
                .order(users::id.asc())
                .offset(skip)
                .limit(limit)
                .load::<User>(conn)?)
        })
        .await
    }

    /// Delete a user. An admin may not delete themselves, nor the last
    /// remaining admin. References from clearance records are cleared and
    /// pending links they initiated are removed.
    pub async fn delete_user(&self, username: &str, acting: &User) -> Result<(), Error> {
        let username = username.to_owned();
        let acting_username = acting.username.clone();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                if username == acting_username {
                    return Err(Error::Forbidden(
                        "admins cannot delete their own account".into(),
                    ));
                }
                let target = users::table
                    .filter(users::username.eq(&username))
                    .first::<User>(conn)
                    .optional()?
                    .ok_or_else(|| Error::NotFound(format!("user '{}' not found", username)))?;
                if target.role == Role::Admin {
                    let admins: i64 = users::table
                        .filter(users::role.eq(Role::Admin))
                        .count()
                        .get_result(conn)?;
                    if admins <= 1 {
                        return Err(Error::Forbidden(
                            "cannot delete the last remaining admin account".into(),
                        ));
                    }
                }
                diesel::update(
                    clearance_records::table.filter(clearance_records::cleared_by.eq(target.id)),
                )
                .set(clearance_records::cleared_by.eq(None::<i32>))
                .execute(conn)?;
                diesel::delete(
                    pending_tag_links::table.filter(pending_tag_links::initiated_by.eq(target.id)),
                )
                .execute(conn)?;
                diesel::delete(users::table.filter(users::id.eq(target.id))).execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Identity store: students
    // ------------------------------------------------------------------

    /// Create a student and atomically seed one `not_completed` clearance
    /// record per department.
    pub async fn create_student(&self, params: StudentParams) -> Result<Student, Error> {
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let existing = students::table
                    .filter(students::student_id.eq(&params.student_id))
                    .first::<Student>(conn)
                    .optional()?;
                if existing.is_some() {
                    return Err(Error::Conflict(format!(
                        "student with id '{}' already exists",
                        params.student_id
                    )));
                }
                if let Some(tag) = &params.tag_id {
                    if tag_holder(conn, tag)?.is_some() {
                        return Err(Error::Conflict(format!(
                            "tag '{}' is already linked to another identity",
                            tag
                        )));
                    }
                }
                let now = Utc::now().naive_utc();
                let student: Student = diesel::insert_into(students::table)
                    .values(NewStudent {
                        student_id: params.student_id,
                        name: params.name,
                        department: params.department,
                        email: params.email,
                        tag_id: params.tag_id,
                        created_at: now,
                        updated_at: now,
                    })
                    .get_result(conn)?;
                for department in Department::ALL {
                    diesel::insert_into(clearance_records::table)
                        .values(NewClearanceRecord {
                            student_id: student.student_id.clone(),
                            department,
                            status: ClearanceStatus::NotCompleted,
                            remarks: None,
                            cleared_by: None,
                            created_at: now,
                            updated_at: now,
                        })
                        .execute(conn)?;
                }
                Ok(student)
            })
        })
        .await
    }

    /// Lookup a student by their student id.
    pub async fn student_by_student_id(&self, student_id: &str) -> Result<Option<Student>, Error> {
        let student_id = student_id.to_owned();
        self.interact(move |conn| {
            Ok(students::table
                .filter(students::student_id.eq(student_id))
                .first::<Student>(conn)
                .optional()?)
        })
        .await
    }

    /// List students with pagination.
    pub async fn list_students(&self, skip: i64, limit: i64) -> Result<Vec<Student>, Error> {
        self.interact(move |conn| {
            Ok(students::table
                .order(students::id.asc())
                .offset(skip)
                .limit(limit)
                .load::<Student>(conn)?)
        })
        .await
    }

    /// Delete a student along with every clearance record they own.
    pub async fn delete_student(&self, student_id: &str) -> Result<(), Error> {
        let student_id = student_id.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let student = students::table
                    .filter(students::student_id.eq(&student_id))
                    .first::<Student>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        Error::NotFound(format!("student with id '{}' not found", student_id))
                    })?;
                diesel::delete(
                    clearance_records::table
                        .filter(clearance_records::student_id.eq(&student.student_id)),
                )
                .execute(conn)?;
                diesel::delete(students::table.filter(students::id.eq(student.id)))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    /// Clear the given tag from whichever identity currently holds it.
    pub async fn unlink_tag(&self, tag: &str) -> Result<(TargetKind, String), Error> {
        let tag = tag.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let now = Utc::now().naive_utc();
                match tag_holder(conn, &tag)? {
                    Some(Principal::Student(s)) => {
                        diesel::update(students::table.filter(students::id.eq(s.id)))
                            .set((
                                students::tag_id.eq(None::<String>),
                                students::updated_at.eq(now),
                            ))
                            .execute(conn)?;
                        Ok((TargetKind::Student, s.student_id))
                    }
                    Some(Principal::StaffAdmin(u)) => {
                        diesel::update(users::table.filter(users::id.eq(u.id)))
                            .set((users::tag_id.eq(None::<String>), users::updated_at.eq(now)))
                            .execute(conn)?;
                        Ok((TargetKind::StaffAdmin, u.username))
                    }
                    None => Err(Error::NotFound(format!(
                        "tag '{}' is not linked to any identity",
                        tag
                    ))),
                }
            })
        })
        .await
    }

    /// Resolve a tag to the identity holding it, students first.
    pub async fn resolve_tag(&self, tag: &str) -> Result<Option<Principal>, Error> {
        let tag = tag.to_owned();
        self.interact(move |conn| tag_holder(conn, &tag)).await
    }

    // ------------------------------------------------------------------
    // Clearance ledger
    // ------------------------------------------------------------------

    /// All clearance records for a student. May return fewer rows than
    /// departments exist; callers must not assume completeness.
    pub async fn clearance_for_student(
        &self,
        student_id: &str,
    ) -> Result<Vec<ClearanceRecord>, Error> {
        let student_id = student_id.to_owned();
        self.interact(move |conn| {
            Ok(clearance_records::table
                .filter(clearance_records::student_id.eq(student_id))
                .order(clearance_records::id.asc())
                .load::<ClearanceRecord>(conn)?)
        })
        .await
    }

    /// Update-or-insert the record for (student, department). The student
    /// must exist.
    pub async fn upsert_clearance(
        &self,
        student_id: &str,
        department: Department,
        status: ClearanceStatus,
        remarks: Option<String>,
        acting_user_id: i32,
    ) -> Result<ClearanceRecord, Error> {
        let student_id = student_id.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let student = students::table
                    .filter(students::student_id.eq(&student_id))
                    .first::<Student>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        Error::NotFound(format!("student with id '{}' not found", student_id))
                    })?;
                let now = Utc::now().naive_utc();
                let existing = clearance_records::table
                    .filter(
                        clearance_records::student_id
                            .eq(&student.student_id)
                            .and(clearance_records::department.eq(department)),
                    )
                    .first::<ClearanceRecord>(conn)
                    .optional()?;
                let record = match existing {
                    Some(record) => diesel::update(
                        clearance_records::table.filter(clearance_records::id.eq(record.id)),
                    )
                    .set((
                        clearance_records::status.eq(status),
                        clearance_records::remarks.eq(remarks),
                        clearance_records::cleared_by.eq(Some(acting_user_id)),
                        clearance_records::updated_at.eq(now),
                    ))
                    .get_result(conn)?,
                    None => diesel::insert_into(clearance_records::table)
                        .values(NewClearanceRecord {
                            student_id: student.student_id,
                            department,
                            status,
                            remarks,
                            cleared_by: Some(acting_user_id),
                            created_at: now,
                            updated_at: now,
                        })
                        .get_result(conn)?,
                };
                Ok(record)
            })
        })
        .await
    }

    /// Delete one (student, department) record, returning that department to
    /// the default state for the student.
    pub async fn reset_clearance(
        &self,
        student_id: &str,
        department: Department,
    ) -> Result<(), Error> {
        let student_id = student_id.to_owned();
        self.interact(move |conn| {
            let student = students::table
                .filter(students::student_id.eq(&student_id))
                .first::<Student>(conn)
                .optional()?
                .ok_or_else(|| {
                    Error::NotFound(format!("student with id '{}' not found", student_id))
                })?;
            diesel::delete(
                clearance_records::table.filter(
                    clearance_records::student_id
                        .eq(student.student_id)
                        .and(clearance_records::department.eq(department)),
                ),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Device registry
    // ------------------------------------------------------------------

    /// Self-registration, idempotent on the hardware id. Always issues a
    /// freshly generated credential: re-registering invalidates whatever key
    /// was issued before, which is how a lost key is revoked.
    pub async fn register_device_self(
        &self,
        device_id: &str,
        location: Option<String>,
    ) -> Result<Device, Error> {
        let device_id = device_id.to_owned();
        let api_key = generate_api_key();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let now = Utc::now().naive_utc();
                let existing = devices::table
                    .filter(devices::device_id.eq(&device_id))
                    .first::<Device>(conn)
                    .optional()?;
                let device = match existing {
                    Some(device) => {
                        info!("rotating credential for re-registered device {}", device_id);
                        diesel::update(devices::table.filter(devices::id.eq(device.id)))
                            .set((
                                devices::api_key.eq(&api_key),
                                devices::location.eq(&location),
                                devices::is_active.eq(true),
                                devices::last_seen.eq(Some(now)),
                                devices::updated_at.eq(now),
                            ))
                            .get_result(conn)?
                    }
                    None => diesel::insert_into(devices::table)
                        .values(NewDevice {
                            name: device_id.clone(),
                            device_id,
                            location,
                            api_key,
                            is_active: true,
                            last_seen: Some(now),
                            created_at: now,
                            updated_at: now,
                        })
                        .get_result(conn)?,
                };
                Ok(device)
            })
        })
        .await
    }

    /// Admin pre-registration. Unlike self-registration this rejects a
    /// duplicate hardware id instead of rotating its credential.
    pub async fn register_device_admin(&self, params: DeviceParams) -> Result<Device, Error> {
        let api_key = generate_api_key();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let existing = devices::table
                    .filter(devices::device_id.eq(&params.device_id))
                    .first::<Device>(conn)
                    .optional()?;
                if existing.is_some() {
                    return Err(Error::Conflict(format!(
                        "device '{}' is already registered",
                        params.device_id
                    )));
                }
                let now = Utc::now().naive_utc();
                let device = diesel::insert_into(devices::table)
                    .values(NewDevice {
                        device_id: params.device_id,
                        name: params.name,
                        location: params.location,
                        api_key,
                        is_active: true,
                        last_seen: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .get_result(conn)?;
                Ok(device)
            })
        })
        .await
    }

    /// Lookup a device by its credential.
    pub async fn device_by_api_key(&self, api_key: &str) -> Result<Option<Device>, Error> {
        let api_key = api_key.to_owned();
        self.interact(move |conn| {
            Ok(devices::table
                .filter(devices::api_key.eq(api_key))
                .first::<Device>(conn)
                .optional()?)
        })
        .await
    }

    /// List every registered device.
    pub async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        self.interact(|conn| Ok(devices::table.order(devices::id.asc()).load::<Device>(conn)?))
            .await
    }

    /// Delete a device along with its logs and pending links.
    pub async fn delete_device(&self, device_id: &str) -> Result<(), Error> {
        let device_id = device_id.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let device = devices::table
                    .filter(devices::device_id.eq(&device_id))
                    .first::<Device>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        Error::NotFound(format!("device '{}' not found", device_id))
                    })?;
                diesel::delete(device_logs::table.filter(device_logs::device_id.eq(device.id)))
                    .execute(conn)?;
                diesel::delete(
                    pending_tag_links::table.filter(pending_tag_links::device_id.eq(device.id)),
                )
                .execute(conn)?;
                diesel::delete(devices::table.filter(devices::id.eq(device.id))).execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    /// Append an audit entry for a device action.
    pub async fn append_device_log(
        &self,
        device_id: Option<i32>,
        tag_id: Option<String>,
        action: String,
    ) -> Result<(), Error> {
        self.interact(move |conn| {
            append_log(conn, device_id, tag_id, action)?;
            Ok(())
        })
        .await
    }

    /// Update a device's liveness timestamp.
    pub async fn touch_device(&self, id: i32) -> Result<(), Error> {
        self.interact(move |conn| {
            diesel::update(devices::table.filter(devices::id.eq(id)))
                .set(devices::last_seen.eq(Some(Utc::now().naive_utc())))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Tag-link broker
    // ------------------------------------------------------------------

    /// Create a pending tag link binding `device_identifier` to the given
    /// target. Fails if the device is missing or inactive, the target is
    /// missing or already linked, or the device already has an unexpired
    /// link in flight.
    pub async fn prepare_tag_link(
        &self,
        device_identifier: &str,
        target_kind: TargetKind,
        target_identifier: &str,
        initiated_by: i32,
        ttl_seconds: i64,
    ) -> Result<PendingTagLink, Error> {
        let device_identifier = device_identifier.to_owned();
        let target_identifier = target_identifier.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let device = devices::table
                    .filter(devices::device_id.eq(&device_identifier))
                    .first::<Device>(conn)
                    .optional()?
                    .filter(|d| d.is_active)
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "device '{}' not found or inactive",
                            device_identifier
                        ))
                    })?;

                let linked_tag = match target_kind {
                    TargetKind::Student => students::table
                        .filter(students::student_id.eq(&target_identifier))
                        .first::<Student>(conn)
                        .optional()?
                        .map(|s| s.tag_id)
                        .ok_or_else(|| {
                            Error::NotFound(format!(
                                "student '{}' not found",
                                target_identifier
                            ))
                        })?,
                    TargetKind::StaffAdmin => users::table
                        .filter(users::username.eq(&target_identifier))
                        .first::<User>(conn)
                        .optional()?
                        .map(|u| u.tag_id)
                        .ok_or_else(|| {
                            Error::NotFound(format!("user '{}' not found", target_identifier))
                        })?,
                };
                // re-linking requires an explicit unlink first
                if linked_tag.is_some() {
                    return Err(Error::Conflict(format!(
                        "'{}' already has a linked tag",
                        target_identifier
                    )));
                }

                let now = Utc::now().naive_utc();
                // lazy expiry: lapsed intents for this device are swept here
                // rather than by a background reaper
                diesel::delete(
                    pending_tag_links::table.filter(
                        pending_tag_links::device_id
                            .eq(device.id)
                            .and(pending_tag_links::expires_at.le(now)),
                    ),
                )
                .execute(conn)?;

                let active = pending_tag_links::table
                    .filter(
                        pending_tag_links::device_id
                            .eq(device.id)
                            .and(pending_tag_links::expires_at.gt(now)),
                    )
                    .first::<PendingTagLink>(conn)
                    .optional()?;
                if active.is_some() {
                    return Err(Error::Conflict(format!(
                        "device '{}' already has a pending tag link",
                        device_identifier
                    )));
                }

                let link = diesel::insert_into(pending_tag_links::table)
                    .values(NewPendingTagLink {
                        device_id: device.id,
                        target_kind,
                        target_identifier,
                        initiated_by,
                        expires_at: now + Duration::seconds(ttl_seconds),
                        created_at: now,
                    })
                    .get_result(conn)?;
                Ok(link)
            })
        })
        .await
    }

    /// Consume the device's pending link with the scanned tag. Single-use:
    /// the link row is removed whether the apply succeeds or the tag turns
    /// out to be taken (fail closed). Every outcome is audit-logged.
    pub async fn submit_scanned_tag(
        &self,
        device: &Device,
        tag: &str,
    ) -> Result<(TargetKind, String), Error> {
        let device_pk = device.id;
        let tag = tag.to_owned();
        let outcome = self
            .interact(move |conn| {
                conn.immediate_transaction(|conn| {
                    let now = Utc::now().naive_utc();
                    let link = match pending_tag_links::table
                        .filter(
                            pending_tag_links::device_id
                                .eq(device_pk)
                                .and(pending_tag_links::expires_at.gt(now)),
                        )
                        .first::<PendingTagLink>(conn)
                        .optional()?
                    {
                        Some(link) => link,
                        None => {
                            append_log(
                                conn,
                                Some(device_pk),
                                Some(tag.clone()),
                                "TAG_LINK_FAIL: no active link".into(),
                            )?;
                            return Ok(SubmitOutcome::NoActiveLink);
                        }
                    };

                    // the tag may have been linked elsewhere since prepare
                    // ran; the consumed intent must not survive that
                    if tag_holder(conn, &tag)?.is_some() {
                        diesel::delete(
                            pending_tag_links::table.filter(pending_tag_links::id.eq(link.id)),
                        )
                        .execute(conn)?;
                        append_log(
                            conn,
                            Some(device_pk),
                            Some(tag.clone()),
                            "TAG_LINK_FAIL: tag already in use".into(),
                        )?;
                        return Ok(SubmitOutcome::TagConflict(tag.clone()));
                    }

                    let applied = match link.target_kind {
                        TargetKind::Student => diesel::update(
                            students::table
                                .filter(students::student_id.eq(&link.target_identifier)),
                        )
                        .set((students::tag_id.eq(Some(&tag)), students::updated_at.eq(now)))
                        .execute(conn)?,
                        TargetKind::StaffAdmin => diesel::update(
                            users::table.filter(users::username.eq(&link.target_identifier)),
                        )
                        .set((users::tag_id.eq(Some(&tag)), users::updated_at.eq(now)))
                        .execute(conn)?,
                    };

                    diesel::delete(
                        pending_tag_links::table.filter(pending_tag_links::id.eq(link.id)),
                    )
                    .execute(conn)?;

                    if applied == 0 {
                        // target deleted between prepare and submit
                        append_log(
                            conn,
                            Some(device_pk),
                            Some(tag.clone()),
                            format!("TAG_LINK_FAIL: target '{}' gone", link.target_identifier),
                        )?;
                        return Ok(SubmitOutcome::TargetMissing(link.target_identifier));
                    }

                    diesel::update(devices::table.filter(devices::id.eq(device_pk)))
                        .set(devices::last_seen.eq(Some(now)))
                        .execute(conn)?;
                    append_log(
                        conn,
                        Some(device_pk),
                        Some(tag.clone()),
                        format!(
                            "TAG_LINK_SUCCESS: {} '{}'",
                            link.target_kind.as_str(),
                            link.target_identifier
                        ),
                    )?;
                    Ok(SubmitOutcome::Linked {
                        kind: link.target_kind,
                        identifier: link.target_identifier,
                    })
                })
            })
            .await?;

        match outcome {
            SubmitOutcome::NoActiveLink => Err(Error::NotFound(
                "no active tag link for this device".into(),
            )),
            SubmitOutcome::TagConflict(tag) => {
                warn!("tag link consumed by conflict on tag {}", tag);
                Err(Error::Conflict(format!(
                    "tag '{}' is already linked to another identity",
                    tag
                )))
            }
            SubmitOutcome::TargetMissing(identifier) => Err(Error::NotFound(format!(
                "link target '{}' no longer exists",
                identifier
            ))),
            SubmitOutcome::Linked { kind, identifier } => Ok((kind, identifier)),
        }
    }

    // ------------------------------------------------------------------
    // Startup bootstrap
    // ------------------------------------------------------------------

    /// Create the bootstrap admin account, once, iff no admin exists yet.
    pub async fn ensure_bootstrap_admin(
        &self,
        username: &str,
        hashed_password: &str,
    ) -> Result<bool, Error> {
        let username = username.to_owned();
        let hashed_password = hashed_password.to_owned();
        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let admins: i64 = users::table
                    .filter(users::role.eq(Role::Admin))
                    .count()
                    .get_result(conn)?;
                if admins > 0 {
                    return Ok(false);
                }
                let now = Utc::now().naive_utc();
                diesel::insert_into(users::table)
                    .values(NewUser {
                        username,
                        hashed_password,
                        name: "Administrator".into(),
                        role: Role::Admin,
                        department: None,
                        is_active: true,
                        tag_id: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .execute(conn)?;
                Ok(true)
            })
        })
        .await
    }
}

/// Resolve the identity currently holding a tag, students first. The tag
/// uniqueness invariant means at most one table can match.
fn tag_holder(conn: &mut SqliteConnection, tag: &str) -> Result<Option<Principal>, Error> {
    if let Some(student) = students::table
        .filter(students::tag_id.eq(tag))
        .first::<Student>(conn)
        .optional()?
    {
        return Ok(Some(Principal::Student(student)));
    }
    if let Some(user) = users::table
        .filter(users::tag_id.eq(tag))
        .first::<User>(conn)
        .optional()?
    {
        return Ok(Some(Principal::StaffAdmin(user)));
    }
    Ok(None)
}

fn append_log(
    conn: &mut SqliteConnection,
    device_id: Option<i32>,
    tag_id: Option<String>,
    action: String,
) -> Result<(), Error> {
    diesel::insert_into(device_logs::table)
        .values(NewDeviceLog {
            device_id,
            tag_id,
            action,
            created_at: Utc::now().naive_utc(),
        })
        .execute(conn)?;
    Ok(())
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Open a fresh file-backed database for one test. The caller removes
    /// the file when done.
    pub async fn test_db(name: &str) -> (Database, String) {
        let path = format!("./test-db-{}.db", name);
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, b"").expect("able to create test database file");
        let db = Database::new(&path).expect("a valid database connection");
        db.init().await.expect("valid migrations");
        (db, path)
    }

    pub fn student_params(student_id: &str) -> StudentParams {
        StudentParams {
            student_id: student_id.into(),
            name: "Ada Obi".into(),
            department: "Computer Science".into(),
            email: None,
            tag_id: None,
        }
    }

    pub fn user_params(username: &str, role: Role, department: Option<Department>) -> UserParams {
        UserParams {
            username: username.into(),
            hashed_password: "not-a-real-hash".into(),
            name: "Test User".into(),
            role,
            department,
            tag_id: None,
        }
    }

    #[tokio::test]
    async fn student_creation_seeds_every_department() {
        let (db, path) = test_db("seed-departments").await;

        db.create_student(student_params("CS/20/001")).await.unwrap();
        let records = db.clearance_for_student("CS/20/001").await.unwrap();

        assert_eq!(records.len(), Department::ALL.len());
        for department in Department::ALL {
            let record = records
                .iter()
                .find(|r| r.department == department)
                .expect("one record per department");
            assert_eq!(record.status, ClearanceStatus::NotCompleted);
        }

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn duplicate_student_id_conflicts() {
        let (db, path) = test_db("duplicate-student").await;

        db.create_student(student_params("CS/20/002")).await.unwrap();
        let err = db
            .create_student(student_params("CS/20/002"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let (db, path) = test_db("upsert-in-place").await;

        db.create_student(student_params("CS/20/003")).await.unwrap();
        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();

        db.upsert_clearance(
            "CS/20/003",
            Department::Library,
            ClearanceStatus::Pending,
            Some("books outstanding".into()),
            admin.id,
        )
        .await
        .unwrap();
        db.upsert_clearance(
            "CS/20/003",
            Department::Library,
            ClearanceStatus::Completed,
            None,
            admin.id,
        )
        .await
        .unwrap();

        let records = db.clearance_for_student("CS/20/003").await.unwrap();
        // still one row per department, updated in place
        assert_eq!(records.len(), Department::ALL.len());
        let library = records
            .iter()
            .find(|r| r.department == Department::Library)
            .unwrap();
        assert_eq!(library.status, ClearanceStatus::Completed);
        assert_eq!(library.cleared_by, Some(admin.id));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn upsert_for_unknown_student_is_not_found() {
        let (db, path) = test_db("upsert-unknown").await;

        let err = db
            .upsert_clearance(
                "GHOST/1",
                Department::Bursary,
                ClearanceStatus::Completed,
                None,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn deleting_a_student_cascades_only_their_records() {
        let (db, path) = test_db("delete-cascade").await;

        db.create_student(student_params("CS/20/004")).await.unwrap();
        db.create_student(student_params("CS/20/005")).await.unwrap();

        db.delete_student("CS/20/004").await.unwrap();

        assert!(db
            .clearance_for_student("CS/20/004")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            db.clearance_for_student("CS/20/005").await.unwrap().len(),
            Department::ALL.len()
        );

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn self_registration_rotates_the_credential() {
        let (db, path) = test_db("credential-rotation").await;

        let first = db
            .register_device_self("RFID-READER-01", Some("Library".into()))
            .await
            .unwrap();
        let second = db
            .register_device_self("RFID-READER-01", Some("Library".into()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.api_key, second.api_key);
        // the old credential no longer resolves
        assert!(db.device_by_api_key(&first.api_key).await.unwrap().is_none());
        assert!(db
            .device_by_api_key(&second.api_key)
            .await
            .unwrap()
            .is_some());

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn admin_registration_rejects_duplicates() {
        let (db, path) = test_db("admin-device-duplicate").await;

        let params = || DeviceParams {
            device_id: "RFID-READER-02".into(),
            name: "Bursary desk".into(),
            location: Some("Bursary".into()),
        };
        db.register_device_admin(params()).await.unwrap();
        let err = db.register_device_admin(params()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn second_prepare_on_same_device_conflicts() {
        let (db, path) = test_db("prepare-conflict").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        db.create_student(student_params("CS/20/006")).await.unwrap();
        db.create_student(student_params("CS/20/007")).await.unwrap();
        db.register_device_self("RFID-READER-03", None).await.unwrap();

        db.prepare_tag_link("RFID-READER-03", TargetKind::Student, "CS/20/006", admin.id, 120)
            .await
            .unwrap();
        let err = db
            .prepare_tag_link("RFID-READER-03", TargetKind::Student, "CS/20/007", admin.id, 120)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn prepare_succeeds_after_previous_link_expires() {
        let (db, path) = test_db("prepare-expiry").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        db.create_student(student_params("CS/20/008")).await.unwrap();
        db.create_student(student_params("CS/20/009")).await.unwrap();
        db.register_device_self("RFID-READER-04", None).await.unwrap();

        // a ttl of zero is immediately lapsed
        db.prepare_tag_link("RFID-READER-04", TargetKind::Student, "CS/20/008", admin.id, 0)
            .await
            .unwrap();
        db.prepare_tag_link("RFID-READER-04", TargetKind::Student, "CS/20/009", admin.id, 120)
            .await
            .unwrap();

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn prepare_rejects_an_already_linked_target() {
        let (db, path) = test_db("prepare-linked-target").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        let mut params = student_params("CS/20/010");
        params.tag_id = Some("A1B2C3D4".into());
        db.create_student(params).await.unwrap();
        db.register_device_self("RFID-READER-05", None).await.unwrap();

        let err = db
            .prepare_tag_link("RFID-READER-05", TargetKind::Student, "CS/20/010", admin.id, 120)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn submit_without_active_link_is_not_found_and_mutates_nothing() {
        let (db, path) = test_db("submit-no-link").await;

        db.create_student(student_params("CS/20/011")).await.unwrap();
        let device = db.register_device_self("RFID-READER-06", None).await.unwrap();

        let err = db.submit_scanned_tag(&device, "F0E1D2C3").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let student = db
            .student_by_student_id("CS/20/011")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(student.tag_id, None);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn submit_consumes_the_link() {
        let (db, path) = test_db("submit-consumes").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        db.create_student(student_params("CS/20/012")).await.unwrap();
        let device = db.register_device_self("RFID-READER-07", None).await.unwrap();

        db.prepare_tag_link("RFID-READER-07", TargetKind::Student, "CS/20/012", admin.id, 120)
            .await
            .unwrap();

        let (kind, identifier) = db.submit_scanned_tag(&device, "AA11BB22").await.unwrap();
        assert_eq!(kind, TargetKind::Student);
        assert_eq!(identifier, "CS/20/012");
        let student = db
            .student_by_student_id("CS/20/012")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(student.tag_id.as_deref(), Some("AA11BB22"));

        // single-use: the same link must not apply twice
        let err = db.submit_scanned_tag(&device, "AA11BB22").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn tag_conflict_during_submit_fails_closed() {
        let (db, path) = test_db("submit-tag-conflict").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        let mut holder = student_params("CS/20/013");
        holder.tag_id = Some("DEADBEEF".into());
        db.create_student(holder).await.unwrap();
        db.create_student(student_params("CS/20/014")).await.unwrap();
        let device = db.register_device_self("RFID-READER-08", None).await.unwrap();

        db.prepare_tag_link("RFID-READER-08", TargetKind::Student, "CS/20/014", admin.id, 120)
            .await
            .unwrap();

        // scanning a tag that is already linked elsewhere conflicts...
        let err = db.submit_scanned_tag(&device, "DEADBEEF").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // ...does not mutate either record...
        let target = db
            .student_by_student_id("CS/20/014")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.tag_id, None);
        // ...and the dangling intent was removed, so a retry is NotFound
        let err = db.submit_scanned_tag(&device, "AB12CD34").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn tags_resolve_students_before_users() {
        let (db, path) = test_db("resolve-order").await;

        let mut params = student_params("CS/20/015");
        params.tag_id = Some("0XSTUDENT".into());
        db.create_student(params).await.unwrap();
        let mut staff = user_params("librarian", Role::Staff, Some(Department::Library));
        staff.tag_id = Some("0XSTAFF".into());
        db.create_user(staff).await.unwrap();

        match db.resolve_tag("0XSTUDENT").await.unwrap() {
            Some(Principal::Student(s)) => assert_eq!(s.student_id, "CS/20/015"),
            other => panic!("expected a student principal, got {:?}", other),
        }
        match db.resolve_tag("0XSTAFF").await.unwrap() {
            Some(Principal::StaffAdmin(u)) => assert_eq!(u.username, "librarian"),
            other => panic!("expected a staff principal, got {:?}", other),
        }
        assert!(db.resolve_tag("0XNOBODY").await.unwrap().is_none());

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn unlink_frees_the_tag_for_a_new_prepare() {
        let (db, path) = test_db("unlink-then-prepare").await;

        let admin = db
            .create_user(user_params("admin", Role::Admin, None))
            .await
            .unwrap();
        let mut params = student_params("CS/20/016");
        params.tag_id = Some("11223344".into());
        db.create_student(params).await.unwrap();
        db.register_device_self("RFID-READER-09", None).await.unwrap();

        let (kind, identifier) = db.unlink_tag("11223344").await.unwrap();
        assert_eq!(kind, TargetKind::Student);
        assert_eq!(identifier, "CS/20/016");

        db.prepare_tag_link("RFID-READER-09", TargetKind::Student, "CS/20/016", admin.id, 120)
            .await
            .unwrap();

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn cannot_delete_the_last_admin() {
        let (db, path) = test_db("last-admin").await;

        let admin = db
            .create_user(user_params("root", Role::Admin, None))
            .await
            .unwrap();
        let second = db
            .create_user(user_params("deputy", Role::Admin, None))
            .await
            .unwrap();

        let err = db.delete_user("root", &admin).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        db.delete_user("deputy", &admin).await.unwrap();
        let err = db.delete_user("deputy", &admin).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        // deputy is gone, root is now the last admin
        let err = db.delete_user("root", &second).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn bootstrap_admin_is_created_only_once() {
        let (db, path) = test_db("bootstrap-admin").await;

        assert!(db.ensure_bootstrap_admin("root", "hash").await.unwrap());
        assert!(!db.ensure_bootstrap_admin("other", "hash").await.unwrap());
        assert!(db.user_by_username("root").await.unwrap().is_some());
        assert!(db.user_by_username("other").await.unwrap().is_none());

        std::fs::remove_file(path).unwrap();
    }
}
