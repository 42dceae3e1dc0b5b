use rocket_db_pools::{sqlx, Database};

#[derive(Database)]
#[database("vitals_db")]
pub struct VitalsDb(sqlx::PgPool);

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run database migrations.
///
/// Idempotent - migrations that have already been applied are skipped.
/// Uses SQLx's built-in migration system to track which migrations have run.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");

    // `run` ensures the migrations table exists, verifies checksums, and
    // applies any pending migrations before we start serving traffic.
    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}
