//! Database migrations

use sqlx::SqlitePool;

use crate::Result;

/// Run all migrations on the database
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(super::schema::SCHEMA).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn test_migrations_run_successfully() {
        let store = crate::store::Store::connect_memory()
            .await
            .expect("should open in-memory store");

        let tables: Vec<String> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .expect("should list tables")
                .iter()
                .map(|row| row.get(0))
                .collect();

        assert!(tables.contains(&"operations".to_string()));
        assert!(tables.contains(&"executions".to_string()));
        assert!(tables.contains(&"detection_executions".to_string()));
        assert!(tables.contains(&"detection_results".to_string()));
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let store = crate::store::Store::connect_memory().await.unwrap();
        run_migrations(store.pool())
            .await
            .expect("second migration should also succeed");
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let store = crate::store::Store::connect_memory().await.unwrap();
        let fk_enabled: bool = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(store.pool())
            .await
            .expect("should query pragma")
            .get(0);
        assert!(fk_enabled);
    }
}
