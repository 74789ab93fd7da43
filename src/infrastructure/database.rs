use crate::entities::{file_permissions, processing_jobs, quarantined_files, secure_files};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm::{ConnectionTrait, Schema};
use std::env;
use std::time::Duration;
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://sheet_ingest.db?mode=rwc";

pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(&db_url);
    opt.max_connections(20)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    info!("🔄 Running auto-migrations...");

    let stmts = vec![
        (
            "secure_files",
            schema
                .create_table_from_entity(secure_files::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "file_permissions",
            schema
                .create_table_from_entity(file_permissions::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "processing_jobs",
            schema
                .create_table_from_entity(processing_jobs::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "quarantined_files",
            schema
                .create_table_from_entity(quarantined_files::Entity)
                .if_not_exists()
                .to_owned(),
        ),
    ];

    for (name, stmt) in stmts {
        let stmt = builder.build(&stmt);
        db.execute(stmt).await?;
        info!("   - Table '{}' checked/created", name);
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_secure_files_owner_id ON secure_files(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_secure_files_deleted_at ON secure_files(deleted_at)",
        "CREATE INDEX IF NOT EXISTS idx_file_permissions_file_id ON file_permissions(file_id)",
        "CREATE INDEX IF NOT EXISTS idx_processing_jobs_file_id ON processing_jobs(file_id)",
        "CREATE INDEX IF NOT EXISTS idx_processing_jobs_state ON processing_jobs(state)",
    ];

    for query in indexes {
        if let Err(e) = db
            .execute(sea_orm::Statement::from_string(builder, query.to_owned()))
            .await
        {
            tracing::warn!("   - Index creation warning: {} -> {}", query, e);
        }
    }

    Ok(())
}
