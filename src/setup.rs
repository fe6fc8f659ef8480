use crate::auth::Auth;
use crate::context::Context;
use crate::error::Result;
use crate::models::file::FileStorage;
use crate::queue::AcceptanceGrader;
use crate::routes::DEFAULT_UPLOAD_LIMIT;
use crate::store::MemoryStore;
use dotenv::dotenv;
use log::{info, warn};
use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub file_dir: PathBuf,
    pub secret_hash_key: String,
    pub admin_user: String,
    pub admin_password: String,
    pub workers: usize,
    pub max_upload_bytes: usize,
}

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> std::result::Result<Config, ConfigError> {
        let secret_hash_key =
            env::var("COGS_SECRET_HASH_KEY").map_err(|_| ConfigError::Missing("COGS_SECRET_HASH_KEY"))?;
        let workers = var_or("COGS_WORKERS", "4");
        let workers = match workers.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::Invalid {
                    name: "COGS_WORKERS",
                    value: workers,
                })
            }
        };
        let max_upload_bytes = var_or("COGS_MAX_UPLOAD_BYTES", &DEFAULT_UPLOAD_LIMIT.to_string());
        let max_upload_bytes = match max_upload_bytes.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::Invalid {
                    name: "COGS_MAX_UPLOAD_BYTES",
                    value: max_upload_bytes,
                })
            }
        };
        Ok(Config {
            bind: var_or("COGS_BIND", "127.0.0.1:5000"),
            file_dir: PathBuf::from(var_or("COGS_FILE_DIR", "./files")),
            secret_hash_key,
            admin_user: var_or("COGS_ADMIN_USER", "admin"),
            admin_password: var_or("COGS_ADMIN_PASSWORD", "admin"),
            workers,
            max_upload_bytes,
        })
    }
}

pub fn setup_dotenv() {
    if dotenv().is_err() {
        info!("No .env file, using the process environment only");
    }
}

/// Builds the shared context. Needs a running tokio runtime.
pub fn establish_context(config: &Config) -> io::Result<Context> {
    let files = FileStorage::new(&config.file_dir)?;
    info!("Storing uploads under {}", files.root().display());
    Ok(Context::new(
        Arc::new(MemoryStore::new()),
        files,
        config.secret_hash_key.as_bytes(),
        Arc::new(AcceptanceGrader),
        config.workers,
    ))
}

/// Makes sure the privileged account exists.
pub fn setup_admin(auth: &Auth, config: &Config) -> Result<()> {
    let (admin, created) = auth.ensure_user(&config.admin_user, &config.admin_password, true)?;
    if created {
        info!("Inserted admin {} ({})", admin.name, admin.id);
        return Ok(());
    }
    if !admin.is_admin {
        warn!("User {} exists but isn't privileged", admin.name);
    }
    info!(
        "Admin already created. Is using default password? {}",
        auth.password_matches(&admin.name, "admin")?
    );
    Ok(())
}
