//! Authentication and authorization for the three credential schemes:
//! bearer tokens for staff/admin, `x-api-key` for devices, and `x-tag-id`
//! for kiosk-style self lookup.

use actix_web::HttpRequest;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::Error;
use crate::models::{Department, Device, Principal, Role, User};

/// The payload of an issued bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username of the account the token was issued to
    pub sub: String,
    /// Role at issue time, informational only; authorization re-reads the
    /// account on every request
    pub role: Role,
    /// Expiry as a unix timestamp
    pub exp: i64,
}

/// Issue a signed bearer token for the given account.
pub fn create_access_token(
    username: &str,
    role: Role,
    secret: &str,
    ttl_minutes: i64,
) -> Result<String, Error> {
    let claims = Claims {
        sub: username.to_owned(),
        role,
        exp: (Utc::now() + Duration::minutes(ttl_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::Internal(format!("failed to sign token: {}", e)))
}

/// Decode and validate a bearer token, including its expiry.
pub fn decode_access_token(token: &str, secret: &str) -> Result<Claims, Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| Error::Unauthorized("invalid or expired token".into()))
}

/// Hash a plaintext password for storage.
pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("failed to hash password: {}", e)))
}

/// Check a plaintext password against a stored hash.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    PasswordHash::new(hashed)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

fn header_value<'r>(req: &'r HttpRequest, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the `Authorization: Bearer` header to an active account.
pub async fn bearer_user(req: &HttpRequest, db: &Database, secret: &str) -> Result<User, Error> {
    let header = header_value(req, "authorization")
        .ok_or_else(|| Error::Unauthorized("missing authorization header".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::Unauthorized("authorization header must carry a bearer token".into()))?;
    let claims = decode_access_token(token, secret)?;
    let user = db
        .user_by_username(&claims.sub)
        .await?
        .ok_or_else(|| Error::Unauthorized("token subject no longer exists".into()))?;
    if !user.is_active {
        return Err(Error::Unauthorized("account is deactivated".into()));
    }
    Ok(user)
}

/// Resolve the `x-api-key` header to an active device.
pub async fn device_from_request(req: &HttpRequest, db: &Database) -> Result<Device, Error> {
    let api_key = header_value(req, "x-api-key")
        .ok_or_else(|| Error::Unauthorized("missing x-api-key header".into()))?;
    let device = db
        .device_by_api_key(api_key)
        .await?
        .ok_or_else(|| Error::Unauthorized("unrecognised api key".into()))?;
    if !device.is_active {
        return Err(Error::Unauthorized("device is deactivated".into()));
    }
    Ok(device)
}

/// Resolve the `x-tag-id` header to whichever identity holds that tag.
pub async fn tag_principal(req: &HttpRequest, db: &Database) -> Result<Principal, Error> {
    let tag = header_value(req, "x-tag-id")
        .ok_or_else(|| Error::Unauthorized("missing x-tag-id header".into()))?;
    let principal = db
        .resolve_tag(tag)
        .await?
        .ok_or_else(|| Error::NotFound(format!("tag '{}' is not linked to any identity", tag)))?;
    if let Principal::StaffAdmin(user) = &principal {
        if !user.is_active {
            return Err(Error::Forbidden("account is deactivated".into()));
        }
    }
    Ok(principal)
}

/// Admin-only routes.
pub fn require_admin(user: &User) -> Result<(), Error> {
    if user.role == Role::Admin {
        Ok(())
    } else {
        Err(Error::Forbidden("admin role required".into()))
    }
}

/// Whether a user may act on records of the given department. Admins may act
/// anywhere; staff only within their own department.
pub fn verify_department_access(user: &User, target: Department) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Staff => user.department == Some(target),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDateTime;

    fn user(role: Role, department: Option<Department>) -> User {
        let now = NaiveDateTime::default();
        User {
            id: 1,
            username: "someone".into(),
            hashed_password: "hash".into(),
            name: "Some One".into(),
            role,
            department,
            is_active: true,
            tag_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn tokens_round_trip() {
        let token = create_access_token("bursar", Role::Staff, "secret", 30).unwrap();
        let claims = decode_access_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "bursar");
        assert_eq!(claims.role, Role::Staff);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        // negative ttl beats the validator's default leeway
        let token = create_access_token("bursar", Role::Staff, "secret", -5).unwrap();
        let err = decode_access_token(&token, "secret").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn tokens_signed_with_another_secret_are_rejected() {
        let token = create_access_token("bursar", Role::Staff, "secret", 30).unwrap();
        let err = decode_access_token(&token, "a different secret").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert_ne!(hash, "hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-phc-string"));
    }

    #[test]
    fn admins_reach_every_department() {
        let admin = user(Role::Admin, None);
        for department in Department::ALL {
            assert!(verify_department_access(&admin, department));
        }
    }

    #[test]
    fn staff_are_scoped_to_their_own_department() {
        let librarian = user(Role::Staff, Some(Department::Library));
        assert!(verify_department_access(&librarian, Department::Library));
        assert!(!verify_department_access(&librarian, Department::Bursary));

        let unassigned = user(Role::Staff, None);
        for department in Department::ALL {
            assert!(!verify_department_access(&unassigned, department));
        }
    }

    #[test]
    fn role_gate_follows_role() {
        assert!(require_admin(&user(Role::Admin, None)).is_ok());
        assert!(matches!(
            require_admin(&user(Role::Staff, Some(Department::Library))),
            Err(Error::Forbidden(_))
        ));
    }
}
