pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{Config, ConfigMetadata, DatabaseConfig, RedisConfig, UsersConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
