//! Server configuration via CLI flags and environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "stadtchat", about = "Realtime community chat and presence hub")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "STADTCHAT_LISTEN", default_value = "127.0.0.1:4600")]
    pub listen: SocketAddr,

    /// Path to the SQLite database (default: <data dir>/stadtchat/stadtchat.db)
    #[arg(long, env = "STADTCHAT_DB")]
    pub db: Option<PathBuf>,

    /// Path to the accounts file mapping auth tokens to user ids
    #[arg(long, env = "STADTCHAT_ACCOUNTS")]
    pub accounts: Option<PathBuf>,
}

impl ServerConfig {
    /// Resolve the database path, creating the parent directory if needed.
    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        let path = match &self.db {
            Some(path) => path.clone(),
            None => {
                let base = dirs::data_dir()
                    .ok_or_else(|| anyhow::anyhow!("no data directory available"))?;
                base.join("stadtchat").join("stadtchat.db")
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(path)
    }
}
