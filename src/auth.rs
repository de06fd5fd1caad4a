use crate::error::AppError;
use argon2::Argon2;
use axum::{
    async_trait,
    extract::{FromRequest, RequestParts},
    headers::{authorization::Bearer, Authorization},
    http::StatusCode,
    Extension, TypedHeader,
};
use jsonwebtoken::{
    errors::Result as JwtResult, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use password_hash::{
    self, rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use uuid::Uuid;

// one day
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

pub fn hash_password(password: impl AsRef<[u8]>) -> password_hash::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_ref(), &salt)
        .map(|h| h.to_string())
}

pub fn verify_password(
    password: impl AsRef<[u8]>,
    password_hash: impl AsRef<str>,
) -> password_hash::Result<bool> {
    let parsed_hash = PasswordHash::new(password_hash.as_ref())?;
    Ok(Argon2::default()
        .verify_password(password.as_ref(), &parsed_hash)
        .is_ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Coordinator,
    CoCoordinator,
    Secretary,
    Media,
    President,
    VicePresident,
    InnovationHead,
    Treasurer,
    Outreach,
    ZenithCommittee,
    Admin,
}

impl Role {
    pub const ALL: [Role; 12] = [
        Role::Student,
        Role::Coordinator,
        Role::CoCoordinator,
        Role::Secretary,
        Role::Media,
        Role::President,
        Role::VicePresident,
        Role::InnovationHead,
        Role::Treasurer,
        Role::Outreach,
        Role::ZenithCommittee,
        Role::Admin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Coordinator => "coordinator",
            Role::CoCoordinator => "co_coordinator",
            Role::Secretary => "secretary",
            Role::Media => "media",
            Role::President => "president",
            Role::VicePresident => "vice_president",
            Role::InnovationHead => "innovation_head",
            Role::Treasurer => "treasurer",
            Role::Outreach => "outreach",
            Role::ZenithCommittee => "zenith_committee",
            Role::Admin => "admin",
        }
    }

    /// Anyone holding a club office counts as a manager.
    pub fn is_manager(self) -> bool {
        self != Role::Student
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::ZenithCommittee)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role `{}`", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn from_base64_secret(secret: &str) -> JwtResult<Self> {
        Ok(Self {
            encoding: EncodingKey::from_base64_secret(secret)?,
            decoding: DecodingKey::from_base64_secret(secret)?,
        })
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    pub exp: u64,
}

pub fn generate_jwt(
    keys: &JwtKeys,
    user_id: Uuid,
    email: &str,
    role: Role,
    exp: Duration,
) -> JwtResult<String> {
    jsonwebtoken::encode(
        &Header::default(),
        &Claims {
            sub: user_id,
            email: email.to_string(),
            role,
            exp: jsonwebtoken::get_current_timestamp() + exp.as_secs(),
        },
        &keys.encoding,
    )
}

pub fn validate_jwt(keys: &JwtKeys, token: &str) -> JwtResult<TokenData<Claims>> {
    jsonwebtoken::decode::<Claims>(token, &keys.decoding, &Validation::default())
}

/// The caller, as identified by a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_authorized(&self, user_id: Uuid) -> Result<(), AppError> {
        if self.id == user_id || self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::from(
                StatusCode::FORBIDDEN,
                "you are not allowed to do that",
            ))
        }
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for AuthUser {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request(req)
                .await
                .map_err(|_| AppError::from(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

        let Extension(keys) = Extension::<Arc<JwtKeys>>::from_request(req)
            .await
            .map_err(|_| anyhow::anyhow!("jwt keys are not installed on the router"))?;

        let data = validate_jwt(&keys, bearer.token()).map_err(|e| {
            tracing::debug!(error = %e, "rejected bearer token");
            AppError::from(StatusCode::UNAUTHORIZED, "invalid or expired token")
        })?;

        Ok(AuthUser {
            id: data.claims.sub,
            email: data.claims.email,
            role: data.claims.role,
        })
    }
}

/// Optional authentication for endpoints that behave slightly differently for
/// signed-in users. A bad token is treated as no token.
pub struct MaybeAuthUser(pub Option<AuthUser>);

#[async_trait]
impl<B: Send> FromRequest<B> for MaybeAuthUser {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthUser(AuthUser::from_request(req).await.ok()))
    }
}

pub struct AdminOnly(pub AuthUser);

#[async_trait]
impl<B: Send> FromRequest<B> for AdminOnly {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request(req).await?;
        if !user.role.is_admin() {
            return Err(AppError::from(StatusCode::FORBIDDEN, "admins only"));
        }
        Ok(AdminOnly(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("Correct-Horse-9").unwrap();
        assert!(verify_password("Correct-Horse-9", &hash).unwrap());
        assert!(!verify_password("correct-horse-9", &hash).unwrap());
    }

    #[test]
    fn jwt_carries_identity() {
        let keys = JwtKeys::from_secret(b"unit-test-secret");
        let id = Uuid::new_v4();
        let token = generate_jwt(&keys, id, "a@college.edu", Role::Treasurer, TOKEN_LIFETIME).unwrap();
        let claims = validate_jwt(&keys, &token).unwrap().claims;
        assert_eq!(claims.sub, id);
        assert_eq!(claims.role, Role::Treasurer);

        let other = JwtKeys::from_secret(b"another-secret");
        assert!(validate_jwt(&other, &token).is_err());
    }

    #[test]
    fn roles_parse_and_rank() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("janitor".parse::<Role>().is_err());
        assert!(!Role::Student.is_manager());
        assert!(Role::Media.is_manager());
        assert!(!Role::President.is_admin());
        assert!(Role::ZenithCommittee.is_admin());
    }
}
