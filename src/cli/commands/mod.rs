//! CLI command implementations

pub mod caches;
pub mod config;
pub mod containers;
pub mod gc;
pub mod migrate;
pub mod volumes;
pub mod workers;

pub use caches::execute as caches;
pub use config::execute as config;
pub use containers::execute as containers;
pub use gc::execute as gc;
pub use migrate::execute as migrate;
pub use volumes::execute as volumes;
pub use workers::execute as workers;

use crate::config::{Config, ConfigManager};
use crate::db::Db;
use crate::error::StoreResult;
use tracing::debug;

/// Open the configured database, creating its directory and schema
pub(crate) async fn open_db(config: &Config) -> StoreResult<Db> {
    ConfigManager::ensure_database_dir(config).await?;
    let path = ConfigManager::database_path(config);
    debug!("Opening database {}", path.display());
    Db::open(path, &config.database)
}
