//! Schema migrations for the libSQL backend.
//!
//! Versions apply in ascending order and are recorded in `schema_migrations`,
//! so reopening a database only runs what it has not seen.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions must stay ascending.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "catalog_and_recruiting",
        sql: r#"
            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                step_type TEXT NOT NULL,
                actions TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                step_detail_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS step_details (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                order_number INTEGER NOT NULL,
                auto_start INTEGER NOT NULL DEFAULT 0,
                required_human_approval INTEGER NOT NULL DEFAULT 0,
                number_of_approvals_needed INTEGER,
                approvers TEXT NOT NULL DEFAULT '[]',
                delay_in_seconds INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_step_details_template ON step_details(template_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                short_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                company_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                workflow_template_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'new',
                source TEXT NOT NULL DEFAULT 'email',
                created_at TEXT NOT NULL,
                UNIQUE (email, company_id)
            );

            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'applied',
                created_at TEXT NOT NULL,
                UNIQUE (job_id, candidate_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "workflow_instances_and_approvals",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                current_step_detail_id TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                version INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                execution_log TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                UNIQUE (job_id, candidate_id, template_id)
            );
            CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status);

            CREATE TABLE IF NOT EXISTS approval_requests (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES workflow_instances(id),
                step_detail_id TEXT NOT NULL,
                approver_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                completed_at TEXT,
                UNIQUE (instance_id, step_detail_id, approver_id)
            );
            CREATE INDEX IF NOT EXISTS idx_approval_requests_approver
                ON approval_requests(approver_id, status);

            CREATE TABLE IF NOT EXISTS approval_decisions (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE REFERENCES approval_requests(id),
                instance_id TEXT NOT NULL,
                step_detail_id TEXT NOT NULL,
                approver_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                comments TEXT,
                decided_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approval_decisions_step
                ON approval_decisions(instance_id, step_detail_id);
        "#,
    },
    Migration {
        version: 3,
        name: "inbound_events_and_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS inbound_events (
                message_id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                note TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_events_status ON inbound_events(status);

            CREATE TABLE IF NOT EXISTS instance_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instance_audit_instance ON instance_audit(instance_id);
        "#,
    },
];

const BOOKKEEPING_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

fn migration_err(context: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(BOOKKEEPING_SQL)
        .await
        .map_err(|e| migration_err("schema_migrations table", e))?;

    let applied = applied_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);
    let mut latest = applied;
    for m in pending {
        tracing::info!(version = m.version, name = m.name, "Running schema migration");
        conn.execute_batch(m.sql)
            .await
            .map_err(|e| migration_err(&format!("V{} {}", m.version, m.name), e))?;
        record_version(conn, m.version, m.name).await?;
        latest = m.version;
    }

    tracing::debug!(from = applied, to = latest, "Schema up to date");
    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await
        .map_err(|e| migration_err("query schema version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| migration_err("read schema version", e))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| migration_err("decode schema version", e))
}

async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| migration_err(&format!("record V{version}"), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "schema_migrations",
            "steps",
            "templates",
            "step_details",
            "jobs",
            "candidates",
            "applications",
            "workflow_instances",
            "approval_requests",
            "approval_decisions",
            "inbound_events",
            "instance_audit",
        ] {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            assert!(rows.next().await.unwrap().is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = applied_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn partial_database_is_upgraded() {
        let conn = test_conn().await;
        conn.execute_batch(BOOKKEEPING_SQL).await.unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).await.unwrap();
        record_version(&conn, 1, "catalog_and_recruiting").await.unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM schema_migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let version: i64 = row.get(0).unwrap();
            let name: String = row.get(1).unwrap();
            applied.push((version, name));
        }
        assert_eq!(
            applied,
            vec![
                (1, "catalog_and_recruiting".to_string()),
                (2, "workflow_instances_and_approvals".to_string()),
                (3, "inbound_events_and_audit".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn approval_request_uniqueness_enforced() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO workflow_instances (id, job_id, candidate_id, template_id, started_at, updated_at)
             VALUES ('i1', 'j', 'c', 't', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        let insert = "INSERT OR IGNORE INTO approval_requests
            (id, instance_id, step_detail_id, approver_id, created_at)
            VALUES (?1, 'i1', 's1', 'alice', '2026-01-01T00:00:00Z')";
        let first = conn.execute(insert, libsql::params!["r1"]).await.unwrap();
        let second = conn.execute(insert, libsql::params!["r2"]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
