use crate::auth::repo_types::{NewUser, User};
use sqlx::PgPool;

impl User {
    /// Find a user by email.
    pub async fn find_by_email(db: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, name, age, gender, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(db)
        .await
    }

    /// Insert a new account and return its id. Unique violations on username or email
    /// come back as the database error.
    pub async fn create(db: &PgPool, new: &NewUser<'_>) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO users (username, email, password_hash, name, age, gender)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(new.username)
        .bind(new.email)
        .bind(new.password_hash)
        .bind(new.name)
        .bind(new.age)
        .bind(new.gender)
        .fetch_one(db)
        .await?;
        Ok(id)
    }

    /// Overwrite the profile fields. No existence check: an unknown id updates nothing.
    pub async fn update_profile(
        db: &PgPool,
        id: i64,
        name: Option<&str>,
        age: Option<i32>,
        gender: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            r#"
            UPDATE users SET name = $1, age = $2, gender = $3
            WHERE id = $4
            "#,
        )
        .bind(name)
        .bind(age)
        .bind(gender)
        .bind(id)
        .execute(db)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn update_password(db: &PgPool, id: i64, password_hash: &str) -> Result<u64, sqlx::Error> {
        let done = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(db)
            .await?;
        Ok(done.rows_affected())
    }
}
