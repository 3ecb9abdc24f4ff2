//! Schema migrations for the audit store.
//!
//! `_migrations` holds one row per applied version. Each pending step runs
//! in its own transaction together with its version row, so a failed step
//! leaves neither partial schema nor a version record behind.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "audit_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                attributes TEXT NOT NULL DEFAULT '{}',
                external_id TEXT,
                score INTEGER NOT NULL,
                tier TEXT NOT NULL,
                matched_rules TEXT NOT NULL DEFAULT '[]',
                destinations TEXT NOT NULL DEFAULT '[]',
                aggregate_status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                dispatch_started_at TEXT NOT NULL,
                dispatch_completed_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_signals_created_at ON signals(created_at);
            CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(aggregate_status);
            CREATE INDEX IF NOT EXISTS idx_signals_external_id ON signals(source, external_id);

            CREATE TABLE IF NOT EXISTS deliveries (
                signal_id TEXT NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT,
                elapsed_ms INTEGER NOT NULL,
                reference TEXT,
                PRIMARY KEY (signal_id, destination)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Audit schema up to date");
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |stage: &str, e: libsql::Error| {
        DatabaseError::Migration(format!(
            "V{} {} ({stage}): {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(|e| failed("begin", e))?;
    let result = async {
        tx.execute_batch(migration.sql)
            .await
            .map_err(|e| failed("schema", e))?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| failed("record version", e))?;
        Ok::<(), DatabaseError>(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await.map_err(|e| failed("commit", e))?;
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applied audit schema migration"
            );
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(version = migration.version, "Migration rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

/// Highest applied version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read schema version: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut rows = conn
            .query(&format!("PRAGMA table_info({table})"), ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(1).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn fresh_database_gets_audit_schema() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let signals = column_names(&conn, "signals").await;
        for column in ["id", "source", "external_id", "score", "tier", "aggregate_status"] {
            assert!(signals.iter().any(|c| c == column), "signals.{column} missing");
        }
        assert_eq!(
            column_names(&conn, "deliveries").await,
            vec!["signal_id", "destination", "status", "attempts", "error", "elapsed_ms", "reference"]
        );
        assert_eq!(applied_version(&conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rerun_applies_nothing_new() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn failing_step_leaves_no_trace() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let broken = Migration {
            version: 2,
            name: "broken",
            sql: "CREATE TABLE half_done (id TEXT); CREATE TABLE oops (",
        };
        let err = apply(&conn, &broken).await.unwrap_err();
        assert!(err.to_string().contains("V2 broken"));

        assert_eq!(applied_version(&conn).await.unwrap(), 1);
        assert!(column_names(&conn, "half_done").await.is_empty());
    }
}
