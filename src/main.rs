use anyhow::{anyhow, Context};
use std::path::PathBuf;
use tab_archive::models::AppSettings;
use tab_archive::{init_tracing, spawn_trash_sweeper, ArchiveCore};

const DATA_DIR_ENV: &str = "TAB_ARCHIVE_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".tab-archive";
const SETTINGS_FILE_NAME: &str = "settings.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    init_tracing(&data_dir).map_err(|error| anyhow!("failed to initialize logging: {}", error))?;

    let settings_path = data_dir.join(SETTINGS_FILE_NAME);
    let settings = AppSettings::load(&settings_path)
        .with_context(|| format!("failed to load {}", settings_path.display()))?;
    let core = ArchiveCore::new(data_dir.clone(), settings).context("failed to open tab archive")?;
    tracing::info!(
        data_dir = %data_dir.display(),
        schema_version = core.schema_version(),
        tabs = core.count_tabs().unwrap_or_default(),
        trashed = core.get_trash_count().unwrap_or_default(),
        "tab archive ready"
    );

    let sweeper = spawn_trash_sweeper(core.clone());
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    sweeper.abort();
    tracing::info!("tab archive shutting down");
    Ok(())
}
