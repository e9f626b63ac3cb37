//! Base resource type catalogue

use crate::error::StoreResult;
use crate::ids::BaseResourceTypeId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// A base resource type as stored in the catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedBaseResourceType {
    pub id: BaseResourceTypeId,
    pub name: String,
}

/// Look up a base resource type by name
pub fn find(conn: &Connection, name: &str) -> StoreResult<Option<UsedBaseResourceType>> {
    let id = conn
        .query_row(
            "SELECT id FROM base_resource_types WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;

    Ok(id.map(|id| UsedBaseResourceType {
        id,
        name: name.to_string(),
    }))
}

/// Register a base resource type, returning the existing row when present
pub fn find_or_create(conn: &Connection, name: &str) -> StoreResult<UsedBaseResourceType> {
    conn.execute(
        "INSERT INTO base_resource_types (name) VALUES (?1) ON CONFLICT (name) DO NOTHING",
        params![name],
    )?;

    let id = conn.query_row(
        "SELECT id FROM base_resource_types WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;

    Ok(UsedBaseResourceType {
        id,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;

    #[test]
    fn find_or_create_is_idempotent() {
        let (_dir, db) = temp_db();
        let conn = db.connection().unwrap();

        let first = find_or_create(&conn, "git").unwrap();
        let second = find_or_create(&conn, "git").unwrap();
        assert_eq!(first, second);
        assert_eq!(count(&db, "base_resource_types"), 1);
    }

    #[test]
    fn find_missing_returns_none() {
        let (_dir, db) = temp_db();
        let conn = db.connection().unwrap();
        assert!(find(&conn, "s3").unwrap().is_none());
    }
}
