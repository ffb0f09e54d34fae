mod repl;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use config::{AppConfig, ConfigStore, TimeoutConfig};
use gateway::Gateway;
use i18n::I18n;
use profile_registry::ProfileRegistry;
use providers::{HttpAdapterFactory, Timeouts};
use secrets::{FileSecretStore, ProfileSecrets, default_secret_dir_from};
use storage_sqlite::SqliteStorage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SECRET_PASSWORD_ENV: &str = "MURMUR_SECRET_PASSWORD";

fn main() {
    let data_dir = config::default_data_dir().unwrap_or_else(|err| {
        eprintln!("{err:#}, using the working directory");
        PathBuf::from(config::APP_DIR_NAME)
    });
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let config_store = ConfigStore::from_default_location()
        .unwrap_or_else(|_| ConfigStore::from_dir(data_dir.join("config")));
    info!(path = %config_store.path().display(), "loading config");
    let config = match config_store.load_or_init() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err:#}");
            AppConfig::default()
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(run(config, &data_dir)) {
        error!("murmur stopped: {err:#}");
        eprintln!("murmur stopped: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig, data_dir: &Path) -> Result<()> {
    let secret_store = FileSecretStore::new(default_secret_dir_from(data_dir)).with_password(
        config
            .secrets
            .local_encryption_enabled
            .then(|| std::env::var(SECRET_PASSWORD_ENV).ok())
            .flatten(),
    );
    if config.secrets.local_encryption_enabled && !secret_store.is_encrypted_mode() {
        warn!("local secret encryption is enabled but {SECRET_PASSWORD_ENV} is not set");
    }
    let secrets = ProfileSecrets::new(Arc::new(secret_store), config.secrets.namespace.clone());

    let database = config.database_path(data_dir);
    let storage = SqliteStorage::connect(&database)
        .await
        .with_context(|| format!("failed to open {}", database.display()))?;

    let factory = HttpAdapterFactory {
        openai: timeouts(config.adapters.openai),
        ollama: timeouts(config.adapters.ollama),
    };
    let gateway = Arc::new(Gateway::new(Arc::new(factory)));
    let registry = ProfileRegistry::new(storage.clone(), secrets, Arc::clone(&gateway));
    let snapshot = registry.load().await.context("failed to load profiles")?;
    info!(
        profiles = snapshot.profiles.len(),
        conversations = storage.count_conversations().await?,
        "murmur ready"
    );

    let mut session = repl::Session::new(
        storage.clone(),
        registry,
        gateway,
        I18n::new(config.language),
        config.storage.page_size,
    );
    if config.ollama.models_enabled {
        session.refresh_models().await;
    }
    let outcome = session.run().await;
    storage.close().await;
    outcome
}

fn timeouts(config: TimeoutConfig) -> Timeouts {
    Timeouts::from_secs(config.request_timeout_secs, config.resource_timeout_secs)
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "murmur.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_desktop=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
