//! Migrate command - create or upgrade the schema

use crate::cli::output;
use crate::config::{Config, ConfigManager};
use crate::db::schema;
use crate::error::StoreResult;

/// Execute the migrate command
pub async fn execute(config: &Config) -> StoreResult<()> {
    let db = super::open_db(config).await?;
    let version = schema::current_version(&db.connection()?)?;

    output::step_ok_detail(
        &format!("Schema at version {}", version),
        &ConfigManager::database_path(config).display().to_string(),
    );
    Ok(())
}
