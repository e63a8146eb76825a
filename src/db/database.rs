use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::{SettingKey, TextRules, UserSettingRow};

/// Per-user settings and subscription lookups the relay pipeline depends on.
#[async_trait]
pub trait UserDataStore: Send + Sync {
    async fn get_user_data_key(&self, user_id: i64, key: SettingKey) -> Result<Option<String>>;

    async fn set_user_data_key(&self, user_id: i64, key: SettingKey, value: &str) -> Result<()>;

    /// Returns whether a value was removed.
    async fn remove_user_data_key(&self, user_id: i64, key: SettingKey) -> Result<bool>;

    async fn is_premium_user(&self, user_id: i64) -> Result<bool>;

    async fn text_rules(&self, user_id: i64) -> Result<TextRules> {
        let replacements = match self
            .get_user_data_key(user_id, SettingKey::Replacements)
            .await?
        {
            Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(&raw).unwrap_or_else(|err| {
                warn!("Ignoring malformed replacements for user {user_id}: {err}");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };
        let delete_words = match self
            .get_user_data_key(user_id, SettingKey::DeleteWords)
            .await?
        {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_else(|err| {
                warn!("Ignoring malformed delete_words for user {user_id}: {err}");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(TextRules {
            replacements,
            delete_words,
        })
    }

    async fn process_text_with_rules(&self, user_id: i64, text: &str) -> Result<String> {
        let rules = self.text_rules(user_id).await?;
        if rules.is_empty() {
            return Ok(text.to_string());
        }
        Ok(rules.apply(text))
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    owner_ids: Vec<i64>,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_settings (\
                user_id INTEGER NOT NULL,\
                key TEXT NOT NULL,\
                value TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                PRIMARY KEY(user_id, key)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS premium_users (\
                user_id INTEGER PRIMARY KEY,\
                expires_at TEXT,\
                granted_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");

        Ok(Database {
            pool,
            owner_ids: Vec::new(),
        })
    }

    /// Owners always count as premium.
    pub fn with_owners(mut self, owner_ids: Vec<i64>) -> Self {
        self.owner_ids = owner_ids;
        self
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_ids.contains(&user_id)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_user_settings(&self, user_id: i64) -> Result<Vec<UserSettingRow>> {
        let rows = sqlx::query_as::<_, UserSettingRow>(
            "SELECT user_id, key, value, updated_at FROM user_settings \
             WHERE user_id = ? ORDER BY key",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn grant_premium(
        &self,
        user_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO premium_users (user_id, expires_at, granted_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             expires_at = excluded.expires_at, \
             granted_at = excluded.granted_at",
        )
        .bind(user_id)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_premium(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM premium_users WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl UserDataStore for Database {
    async fn get_user_data_key(&self, user_id: i64, key: SettingKey) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM user_settings WHERE user_id = ? AND key = ?")
                .bind(user_id)
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.filter(|value| !value.trim().is_empty()))
    }

    async fn set_user_data_key(&self, user_id: i64, key: SettingKey, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (user_id, key, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, key) DO UPDATE SET \
             value = excluded.value, \
             updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key.as_str())
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_user_data_key(&self, user_id: i64, key: SettingKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_settings WHERE user_id = ? AND key = ?")
            .bind(user_id)
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_premium_user(&self, user_id: i64) -> Result<bool> {
        if self.is_owner(user_id) {
            return Ok(true);
        }
        let row: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT expires_at FROM premium_users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match row {
            Some(None) => true,
            Some(Some(expires_at)) => expires_at > Utc::now(),
            None => false,
        })
    }
}
