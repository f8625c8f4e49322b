//! Manticore Search client
//!
//! Queries go over the MySQL wire protocol. Manticore only speaks the text
//! protocol and rejects most session variables, so every statement is sent
//! with [`sqlx::raw_sql`] and the connect-time `SET` statements are disabled.
//! Configuration changes are applied inside the search container with
//! `docker exec`.

use super::{SearchConfigDocument, SearchEngine};
use crate::config::SearchConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tabsearch_common::ident::quote_literal;
use tokio::process::Command;
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Word used to check that autocomplete answers
const AUTOCOMPLETE_PROBE: &str = "the";

/// Connect options accepted by Manticore's MySQL listener
pub fn connect_options(host: &str, port: u16, user: &str, password: &str) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(host)
        .port(port)
        .pipes_as_concat(false)
        .no_engine_substitution(false)
        .set_names(false)
        .timezone(None::<String>);
    if !user.is_empty() {
        options = options.username(user).password(password);
    }
    options
}

/// Lazily connected pool for a Manticore MySQL listener
pub fn lazy_pool(host: &str, port: u16, user: &str, password: &str) -> MySqlPool {
    MySqlPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy_with(connect_options(host, port, user, password))
}

pub struct ManticoreClient {
    pool: MySqlPool,
    config: SearchConfig,
}

impl ManticoreClient {
    pub fn connect_lazy(config: &SearchConfig) -> Self {
        Self {
            pool: lazy_pool(&config.host, config.port, &config.user, &config.password),
            config: config.clone(),
        }
    }

    async fn write_config(&self, document: &SearchConfigDocument) -> Result<()> {
        if let Some(parent) = self.config.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config.config_path, &document.text).await?;
        info!(
            path = %self.config.config_path.display(),
            bytes = document.text.len(),
            "Search configuration written"
        );
        Ok(())
    }

    /// Run a command inside the search container
    async fn container_exec(&self, args: &[&str]) -> Result<()> {
        debug!(container = %self.config.container, args = ?args, "docker exec");
        let output = Command::new("docker")
            .arg("exec")
            .arg(&self.config.container)
            .args(args)
            .env("MSYS_NO_PATHCONV", "1")
            .output()
            .await?;

        if !output.status.success() {
            return Err(PipelineError::Search(format!(
                "`{}` in container {} failed with {}: {}",
                args.join(" "),
                self.config.container,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchEngine for ManticoreClient {
    async fn apply_config(&self, document: &SearchConfigDocument, table: &str) -> Result<()> {
        self.write_config(document).await?;

        if !document.directories.is_empty() {
            let mut mkdir = vec!["mkdir", "-p"];
            mkdir.extend(document.directories.iter().map(String::as_str));
            self.container_exec(&mkdir).await?;
        }

        self.container_exec(&["bash", &self.config.reload_script, table])
            .await?;
        info!(table = %table, "Search engine reconfigured");
        Ok(())
    }

    async fn probe_count(&self, table: &str) -> Result<u64> {
        let row = sqlx::raw_sql(&format!("SELECT COUNT(*) AS count FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get_unchecked(0)?;
        Ok(count.max(0) as u64)
    }

    async fn probe_sample(&self, table: &str) -> Result<()> {
        sqlx::raw_sql(&format!("SELECT * FROM {} LIMIT 1", table))
            .fetch_all(&self.pool)
            .await?;
        Ok(())
    }

    async fn probe_autocomplete(&self, table: &str) -> Result<()> {
        sqlx::raw_sql(&format!(
            "CALL AUTOCOMPLETE({}, {})",
            quote_literal(AUTOCOMPLETE_PROBE),
            quote_literal(table)
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(())
    }
}
