//! Schema initialization.
//!
//! The seed script is embedded at compile time and applied once at startup.
//! Running it again is safe: sqlx tracks applied migrations in the store
//! itself.

use sqlx::SqlitePool;

/// Apply the seed script to a freshly-opened store.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    log::debug!("running store migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

    Ok(())
}
