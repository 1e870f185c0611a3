use anyhow::Result;
use clap::{Parser, Subcommand};
use kbserve::cache::EmbeddingCache;
use kbserve::db::{migrate, Db};
use kbserve::embeddings::Embedder;
use kbserve::http::{create_router, AppState};
use kbserve::ingest::JobRunner;
use kbserve::query::QueryEngine;
use kbserve::Config;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kbserve", version, about = "Knowledge-base ingestion and retrieval service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Verify the database schema and exit
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Verify) {
        Command::Serve { port } => run_server(port).await,
        Command::Verify => run_schema_verification().await,
    }
}

/// Open the database and bring the schema up to date.
async fn init_db(config: &Config) -> Result<Arc<Db>> {
    let db = Arc::new(Db::new(config.db_path()));
    let migrations_dir = Path::new("migrations").to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;
    log::info!("Database initialized successfully");
    Ok(db)
}

/// Build the configured embedder with an LRU query-embedding cache.
fn build_embedder(config: &Config) -> Result<Arc<kbserve::embeddings::EmbedderHandle>> {
    let cache = if config.embeddings.cache_capacity > 0 {
        Some(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity)))
    } else {
        None
    };
    Ok(Arc::new(Embedder::from_config(&config.embeddings, cache)?))
}

async fn run_server(port_override: Option<u16>) -> Result<()> {
    log::info!("Starting kbserve v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);
    log::info!("Database path: {}", config.db_path().display());
    log::info!("Upload directory: {}", config.upload_dir().display());
    log::info!(
        "Embeddings: {} ({}, {} dims)",
        config.embeddings.provider,
        config.embeddings.model,
        config.embeddings.dimensions
    );

    let db = init_db(&config).await?;
    tokio::fs::create_dir_all(config.upload_dir()).await?;

    let embedder = build_embedder(&config)?;
    let jobs = Arc::new(JobRunner::new(Arc::clone(&db), Arc::clone(&embedder)));
    let engine = Arc::new(QueryEngine::new(
        Arc::clone(&db),
        Arc::clone(&embedder),
        config.search.clone(),
    ));

    let state = AppState {
        db,
        embedder,
        engine,
        jobs,
        config: Arc::clone(&config),
    };
    let app = create_router(state);

    let port = port_override.unwrap_or(config.http_server.port);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Verify that all expected database objects exist.
async fn run_schema_verification() -> Result<()> {
    log::info!("Starting kbserve v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    let db = init_db(&config).await?;

    db.with_connection(|conn| {
        use kbserve::KbServeError;

        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = [
            "knowledge_bases",
            "uploads",
            "documents",
            "chunks",
            "chunks_fts",
            "ingestion_jobs",
            "job_files",
            "templates",
            "execution_layers",
            "guard_rails",
            "agents",
            "agent_execution_layers",
            "agent_guard_rails",
            "conversations",
            "query_logs",
            "schema_migrations",
        ];
        for table in &expected_tables {
            if !tables.iter().any(|t| t == table) {
                return Err(KbServeError::Config(format!("Missing table: {}", table)));
            }
            log::debug!("Table exists: {}", table);
        }

        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='trigger' ORDER BY name")?;
        let triggers: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for trigger in ["chunks_fts_insert", "chunks_fts_delete", "chunks_fts_update"] {
            if !triggers.iter().any(|t| t.contains(trigger)) {
                return Err(KbServeError::Config(format!("Missing trigger: {}", trigger)));
            }
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(KbServeError::Config(format!(
                "Journal mode is not WAL: {}",
                journal_mode
            )));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(KbServeError::Config(format!(
                "Database integrity check failed: {}",
                integrity
            )));
        }

        Ok(())
    })
    .await?;

    log::info!("Database schema verification complete");
    Ok(())
}
