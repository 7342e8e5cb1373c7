use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 0001_staging.sql
    r#"CREATE TABLE IF NOT EXISTS staging_rows (
        id BIGSERIAL PRIMARY KEY,
        partition_key VARCHAR(64) NOT NULL,
        run_id UUID NOT NULL,
        request_key VARCHAR(64) NOT NULL,
        params JSONB NOT NULL,
        input JSONB NOT NULL,
        data BYTEA NOT NULL,
        committed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uq_staging_rows_request UNIQUE (partition_key, run_id, request_key)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_staging_rows_partition
        ON staging_rows(partition_key, id) WHERE committed"#,
    r#"CREATE INDEX IF NOT EXISTS idx_staging_rows_run
        ON staging_rows(partition_key, run_id)"#,
    r#"CREATE TABLE IF NOT EXISTS collector_state (
        partition_key VARCHAR(64) PRIMARY KEY,
        cursor_at TIMESTAMPTZ,
        time_after TIMESTAMPTZ,
        latest_run_id UUID,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration:
/// dropping it stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "sluice_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/sluice_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
