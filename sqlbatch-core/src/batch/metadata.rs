use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Connection parameters for a user's database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDatabaseMetadata {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for UserDatabaseMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDatabaseMetadata")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves a tenant name to the database its jobs run against.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDatabaseMetadataService: Send + Sync {
    async fn get_user_metadata(&self, user: &str) -> Result<UserDatabaseMetadata>;
}

/// Naming rules used when the user record does not carry explicit values.
/// `{user_id}` is substituted with the record's `id` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataTemplates {
    pub db_name: String,
    pub db_user: String,
    pub default_host: String,
    /// Port jobs connect to. Batch traffic bypasses the pooler.
    pub batch_port: u16,
    pub key_prefix: String,
}

impl Default for MetadataTemplates {
    fn default() -> Self {
        Self {
            db_name: "cartodb_user_{user_id}_db".to_string(),
            db_user: "cartodb_user_{user_id}".to_string(),
            default_host: "localhost".to_string(),
            batch_port: 5432,
            key_prefix: "rails:users:".to_string(),
        }
    }
}

impl MetadataTemplates {
    fn render(template: &str, user_id: &str) -> String {
        template.replace("{user_id}", user_id)
    }

    /// Builds metadata from the fields of a `rails:users:<user>` hash.
    pub fn resolve(
        &self,
        user: &str,
        record: &HashMap<String, String>,
    ) -> Result<UserDatabaseMetadata> {
        let field = |name: &str| {
            record
                .get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let user_id = field("id").ok_or_else(|| {
            BatchError::Metadata(format!("user {user} has no id in its metadata record"))
        })?;

        Ok(UserDatabaseMetadata {
            host: field("database_host")
                .unwrap_or(self.default_host.as_str())
                .to_string(),
            port: self.batch_port,
            dbname: field("database_name")
                .map(str::to_string)
                .unwrap_or_else(|| Self::render(&self.db_name, user_id)),
            user: Self::render(&self.db_user, user_id),
            password: field("database_password").unwrap_or_default().to_string(),
        })
    }
}

/// Reads user records from the Redis hashes maintained by the account
/// service.
#[derive(Clone)]
pub struct RedisUserMetadataService {
    conn: ConnectionManager,
    templates: MetadataTemplates,
}

impl fmt::Debug for RedisUserMetadataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisUserMetadataService")
            .field("templates", &self.templates)
            .finish()
    }
}

impl RedisUserMetadataService {
    pub fn new(conn: ConnectionManager, templates: MetadataTemplates) -> Self {
        Self { conn, templates }
    }
}

#[async_trait]
impl UserDatabaseMetadataService for RedisUserMetadataService {
    async fn get_user_metadata(&self, user: &str) -> Result<UserDatabaseMetadata> {
        let key = format!("{}{}", self.templates.key_prefix, user);
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = conn.hgetall(&key).await.map_err(|e| {
            BatchError::Metadata(format!("Failed to load {key}: {e}"))
        })?;

        if record.is_empty() {
            return Err(BatchError::Metadata(format!("unknown user {user}")));
        }

        self.templates.resolve(user, &record)
    }
}

/// Fixed user table, typically loaded from the configuration file.
#[derive(Clone, Debug, Default)]
pub struct StaticUserMetadataService {
    users: HashMap<String, UserDatabaseMetadata>,
}

impl StaticUserMetadataService {
    pub fn new(users: HashMap<String, UserDatabaseMetadata>) -> Self {
        Self { users }
    }

    pub fn with_user(mut self, user: impl Into<String>, metadata: UserDatabaseMetadata) -> Self {
        self.users.insert(user.into(), metadata);
        self
    }
}

#[async_trait]
impl UserDatabaseMetadataService for StaticUserMetadataService {
    async fn get_user_metadata(&self, user: &str) -> Result<UserDatabaseMetadata> {
        self.users
            .get(user)
            .cloned()
            .ok_or_else(|| BatchError::Metadata(format!("unknown user {user}")))
    }
}
