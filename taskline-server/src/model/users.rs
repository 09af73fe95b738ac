//! Service users storage

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use sqlx::prelude::{FromRow, Type};
use thiserror::Error;
use uuid::Uuid;

use crate::model::auth::Role;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid user id format")]
    InvalidUserId,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Email already exists")]
    EmailTaken,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Salt mixed into every password digest. Password hashing policy is fixed for the service, the
/// salt only makes sure digests are not reusable outside of it.
const PASSWORD_APP_SALT: &str = "TasklinePasswordDigestSalt";

/// Newtype for user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| Error::InvalidUserId)?;
        Ok(Self(id))
    }
}

impl UserId {
    /// Generates a fresh random user id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fetches `User` with this id from database
    #[cfg(test)]
    pub async fn fetch(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<Option<User>, Error> {
        User::fetch(db, self).await
    }

    /// Checks if an account with this id exists
    pub async fn exists(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<bool, Error> {
        let row: Option<(i64,)> = sqlx::query_as("select 1 from users where id = ?")
            .bind(self)
            .fetch_optional(db)
            .await?;

        Ok(row.is_some())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

/// User account as visible through the API
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl User {
    /// Fetches user from the database
    #[cfg(test)]
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<Option<Self>, Error> {
        let user = sqlx::query_as("select id, name, email, role from users where id = ?")
            .bind(user_id)
            .fetch_optional(db)
            .await?;

        Ok(user)
    }

    /// Fetches user by the login email
    #[cfg(test)]
    pub async fn find_by_email(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        email: &str,
    ) -> Result<Option<Self>, Error> {
        let user = sqlx::query_as("select id, name, email, role from users where email = ?")
            .bind(email)
            .fetch_optional(db)
            .await?;

        Ok(user)
    }

    /// Verifies user credentials, returning the user if they match
    pub async fn login(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        email: &str,
        password: &str,
    ) -> Result<Option<Self>, Error> {
        let digest = password_digest(email, password);
        let user = sqlx::query_as(
            "select id, name, email, role from users where email = ? and password_digest = ?",
        )
        .bind(email)
        .bind(digest)
        .fetch_optional(db)
        .await?;

        Ok(user)
    }
}

/// Data required to create an account
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl NewUser {
    /// Helper to create an user
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    /// Creates user in the database with the `User` role
    pub async fn create(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<User, Error> {
        self.create_with_role(db, Role::User).await
    }

    /// Creates user in the database
    pub async fn create_with_role(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        role: Role,
    ) -> Result<User, Error> {
        let Self {
            name,
            email,
            password,
        } = self;

        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        if email.is_empty() {
            return Err(Error::MissingField("email"));
        }
        if password.is_empty() {
            return Err(Error::MissingField("password"));
        }

        let id = UserId::new();
        let digest = password_digest(&email, &password);
        let insertion = sqlx::query(
            "insert into users(id, name, email, password_digest, role) values (?, ?, ?, ?, ?) \
             on conflict(email) do nothing",
        )
        .bind(id)
        .bind(&name)
        .bind(&email)
        .bind(digest)
        .bind(role)
        .execute(db)
        .await?;

        if insertion.rows_affected() == 0 {
            return Err(Error::EmailTaken);
        }

        Ok(User {
            id,
            name,
            email,
            role,
        })
    }
}

/// Digest stored in place of the password
fn password_digest(email: &str, password: &str) -> String {
    let data = format!("{PASSWORD_APP_SALT}.{email}.{password}");

    let mut hasher = Sha3_256::new();
    hasher.update(data.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("model/migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn users_empty_initially() {
        let pool = setup_pool().await;

        let (count,): (i64,) = sqlx::query_as("select count(*) from users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn creating_users() {
        let pool = setup_pool().await;

        let user1 = NewUser::new("user1", "user1@example.com", "pass1")
            .create(&pool)
            .await
            .unwrap();
        assert_eq!(user1.role, Role::User);
        assert_eq!(user1.id.fetch(&pool).await.unwrap().unwrap(), user1);
        assert!(user1.id.exists(&pool).await.unwrap());

        let user2 = NewUser::new("user2", "user2@example.com", "pass2")
            .create_with_role(&pool, Role::Admin)
            .await
            .unwrap();
        assert_ne!(user1.id, user2.id);
        assert_eq!(
            User::find_by_email(&pool, "user2@example.com")
                .await
                .unwrap()
                .unwrap(),
            user2
        );

        // Names *can* collide, emails cannot
        let user3 = NewUser::new("user1", "user3@example.com", "pass3")
            .create(&pool)
            .await
            .unwrap();
        assert_ne!(user3.id, user1.id);

        let err = NewUser::new("user4", "user1@example.com", "pass4")
            .create(&pool)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmailTaken));

        let (count,): (i64,) = sqlx::query_as("select count(*) from users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let pool = setup_pool().await;

        let err = NewUser::new("", "user@example.com", "pass")
            .create(&pool)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField("name")));

        let err = NewUser::new("user", "user@example.com", "")
            .create(&pool)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField("password")));
    }

    #[tokio::test]
    async fn login_with_credentials() {
        let pool = setup_pool().await;

        let user = NewUser::new("user1", "user1@example.com", "secret")
            .create(&pool)
            .await
            .unwrap();

        let logged = User::login(&pool, "user1@example.com", "secret")
            .await
            .unwrap();
        assert_eq!(logged, Some(user));

        let logged = User::login(&pool, "user1@example.com", "wrong")
            .await
            .unwrap();
        assert_eq!(logged, None);

        assert!(!UserId::new().exists(&pool).await.unwrap());
    }
}
