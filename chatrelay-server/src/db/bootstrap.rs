//! Schema bootstrap from the SQL scripts under `db.bootstrap_path`.
//!
//! Each stage is a subdirectory (`schema`, then `indexes`) whose `.sql`
//! files run in file-name order, one transaction per file. Every script is
//! read before the first one executes, so a broken layout fails fast.

use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use shared::config::server::DatabaseConfig;

const STAGES: [&str; 2] = ["schema", "indexes"];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap layout problem at {path}: {reason}")]
    Layout { path: PathBuf, reason: &'static str },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bootstrap script {script} failed: {source}")]
    Sql {
        script: String,
        #[source]
        source: sqlx::Error,
    },
}

/// One script ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Script {
    stage: &'static str,
    name: String,
    sql: String,
}

/// Applies every bootstrap script and returns how many ran.
///
/// # Errors
/// Returns [`BootstrapError`] when the layout is incomplete, a script cannot
/// be read, or a statement fails. A failing script rolls back on its own.
pub async fn run(pool: &PgPool, config: &DatabaseConfig) -> Result<usize, BootstrapError> {
    let scripts = plan(&config.bootstrap_path)?;
    info!(
        path = %config.bootstrap_path.display(),
        scripts = scripts.len(),
        "running database bootstrap"
    );

    for script in &scripts {
        apply(pool, script).await?;
        metrics::counter!("chatrelay_bootstrap_scripts_total", "stage" => script.stage)
            .increment(1);
    }

    Ok(scripts.len())
}

/// Cheapest possible round trip.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// The conversation tables must be queryable.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1 FROM chatrelay.conversations LIMIT 1")
        .execute(pool)
        .await
        .map(|_| ())
}

fn plan(root: &Path) -> Result<Vec<Script>, BootstrapError> {
    if !root.is_dir() {
        return Err(BootstrapError::Layout {
            path: root.to_path_buf(),
            reason: "bootstrap root is not a directory",
        });
    }

    let mut scripts = Vec::new();
    for stage in STAGES {
        let dir = root.join(stage);
        if !dir.is_dir() {
            return Err(BootstrapError::Layout {
                path: dir,
                reason: "stage directory is missing",
            });
        }

        for path in sql_files(&dir)? {
            let sql = fs::read_to_string(&path).map_err(|source| BootstrapError::Io {
                path: path.clone(),
                source,
            })?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if sql.trim().is_empty() {
                debug!(stage, script = %name, "skipping empty script");
                continue;
            }
            scripts.push(Script { stage, name, sql });
        }
    }

    Ok(scripts)
}

fn sql_files(dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let io_error = |source| BootstrapError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = fs::read_dir(dir)
        .map_err(io_error)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    files.retain(|path| {
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
    });
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

async fn apply(pool: &PgPool, script: &Script) -> Result<(), BootstrapError> {
    let failed = |source| BootstrapError::Sql {
        script: format!("{}/{}", script.stage, script.name),
        source,
    };

    info!(stage = script.stage, script = %script.name, "applying bootstrap script");
    let mut tx = pool.begin().await.map_err(failed)?;
    // Scripts hold several statements, which prepared queries reject.
    sqlx::raw_sql(script.sql.trim())
        .execute(&mut *tx)
        .await
        .map_err(failed)?;
    tx.commit().await.map_err(failed)
}
