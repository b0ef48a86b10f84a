//! The credential store.
//!
//! An embedded SQLite database holding the login users and the hostname
//! allow-list. The on-disk format is private to this module; everything else
//! goes through the async API. Passwords are never stored: each user record
//! keeps a random salt and the hex SHA-256 of salt‖password.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, sqlite::SqlitePool};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub admin: bool,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                salt TEXT NOT NULL,
                key TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hostnames (
                hostname TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or update a login user.
    pub async fn add_user(&self, username: &str, password: &str, admin: bool) -> Result<()> {
        let salt: [u8; 16] = rand::random();

        sqlx::query(
            r#"
            INSERT INTO users (username, salt, key, is_admin, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                salt = excluded.salt,
                key = excluded.key,
                is_admin = excluded.is_admin
            "#,
        )
        .bind(username)
        .bind(hex::encode(salt))
        .bind(salted_key(&salt, password))
        .bind(admin as i64)
        .bind(current_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_user(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Check a login attempt against the stored salted key.
    pub async fn verify_user(&self, username: &str, password: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT salt, key, is_admin FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let salt = hex::decode(row.get::<String, _>("salt"))?;
        if salted_key(&salt, password) != row.get::<String, _>("key") {
            return Ok(None);
        }

        Ok(Some(UserRecord {
            username: username.to_string(),
            admin: row.get::<i64, _>("is_admin") != 0,
        }))
    }

    pub async fn is_user_registered(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    pub async fn usernames(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT username FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("username")).collect())
    }

    pub async fn add_hostname(&self, hostname: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hostnames (hostname, created_at)
            VALUES (?, ?)
            ON CONFLICT(hostname) DO NOTHING
            "#,
        )
        .bind(hostname)
        .bind(current_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_hostname(&self, hostname: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM hostnames WHERE hostname = ?")
            .bind(hostname)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn hostnames(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT hostname FROM hostnames ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("hostname")).collect())
    }
}

fn salted_key(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temporary() -> Result<CredentialStore> {
        let path = std::env::temp_dir().join(format!(
            "broker-credentials-{}.db3",
            hex::encode(rand::random::<[u8; 8]>())
        ));
        CredentialStore::open(&path).await
    }

    #[tokio::test]
    async fn verifies_salted_passwords() -> Result<()> {
        let store = open_temporary().await?;

        store.add_user("alice", "secret", true).await?;
        store.add_user("bob", "hunter2", false).await?;

        let alice = store.verify_user("alice", "secret").await?.unwrap();
        assert!(alice.admin);

        let bob = store.verify_user("bob", "hunter2").await?.unwrap();
        assert!(!bob.admin);

        assert!(store.verify_user("alice", "wrong").await?.is_none());
        assert!(store.verify_user("carol", "secret").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn user_lifecycle() -> Result<()> {
        let store = open_temporary().await?;

        store.add_user("alice", "one", false).await?;
        assert!(store.is_user_registered("alice").await?);

        // Re-adding rotates the salt and password.
        store.add_user("alice", "two", true).await?;
        assert!(store.verify_user("alice", "one").await?.is_none());
        assert!(store.verify_user("alice", "two").await?.unwrap().admin);

        assert_eq!(store.usernames().await?, vec!["alice".to_string()]);
        assert!(store.remove_user("alice").await?);
        assert!(!store.remove_user("alice").await?);
        Ok(())
    }

    #[tokio::test]
    async fn hostname_allow_list() -> Result<()> {
        let store = open_temporary().await?;

        store.add_hostname("localhost").await?;
        store.add_hostname("localhost").await?;
        store.add_hostname("lab.example.org").await?;

        assert_eq!(
            store.hostnames().await?,
            vec!["lab.example.org".to_string(), "localhost".to_string()]
        );

        assert!(store.remove_hostname("localhost").await?);
        assert_eq!(store.hostnames().await?, vec!["lab.example.org".to_string()]);
        Ok(())
    }
}
