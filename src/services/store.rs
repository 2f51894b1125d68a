//! Token persistence.
//!
//! `TokenStore` is the contract the ingest consumers and the analysis
//! scheduler depend on. `SqliteTokenStore` is the production backend;
//! `MemoryTokenStore` keeps everything in a map for tests and dry runs.

use crate::types::{Pubkey, Token};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Token>>;

    /// Insert or refresh a token. Analysis fields of an existing row are kept.
    async fn save(&self, token: &Token) -> Result<()>;

    /// Set the SOL market cap. Returns the updated token, or `None` if the
    /// address is unknown.
    async fn update_market_cap(&self, address: &str, market_cap_sol: f64)
        -> Result<Option<Token>>;

    /// Record a finished analysis. Fails for unknown addresses.
    async fn update_analysis(&self, address: &str, analysis: &str) -> Result<()>;
}

#[derive(FromRow)]
struct TokenRow {
    address: String,
    symbol: String,
    name: String,
    initial_buy: f64,
    v_tokens: f64,
    v_sol: f64,
    market_cap_sol: f64,
    created_at: i64,
    analysis: Option<String>,
    analysis_completed: bool,
    analysis_timestamp: Option<i64>,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            address: row.address,
            symbol: row.symbol,
            name: row.name,
            initial_buy: row.initial_buy,
            v_tokens: row.v_tokens,
            v_sol: row.v_sol,
            market_cap_sol: row.market_cap_sol,
            created_at: DateTime::<Utc>::from_timestamp_millis(row.created_at).unwrap_or_default(),
            analysis: row.analysis,
            analysis_completed: row.analysis_completed,
            analysis_timestamp: row
                .analysis_timestamp
                .and_then(DateTime::<Utc>::from_timestamp_millis),
        }
    }
}

/// SQLite-backed token store.
pub struct SqliteTokenStore {
    pool: Pool<Sqlite>,
}

impl SqliteTokenStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to SQLite database at {}", url))?;

        Self::create_schema(&pool).await?;
        info!("SqliteTokenStore connected to {}", url);

        Ok(Self { pool })
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                address TEXT PRIMARY KEY NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                initial_buy REAL NOT NULL,
                v_tokens REAL NOT NULL,
                v_sol REAL NOT NULL,
                market_cap_sol REAL NOT NULL,
                created_at INTEGER NOT NULL,
                analysis TEXT,
                analysis_completed BOOLEAN NOT NULL DEFAULT FALSE,
                analysis_timestamp INTEGER
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create tokens table")?;

        Ok(())
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self, address: &str) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch token")?;

        Ok(row.map(Token::from))
    }

    async fn save(&self, token: &Token) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (
                address, symbol, name, initial_buy, v_tokens, v_sol,
                market_cap_sol, created_at, analysis, analysis_completed, analysis_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                initial_buy = excluded.initial_buy,
                v_tokens = excluded.v_tokens,
                v_sol = excluded.v_sol,
                market_cap_sol = excluded.market_cap_sol
            "#,
        )
        .bind(&token.address)
        .bind(&token.symbol)
        .bind(&token.name)
        .bind(token.initial_buy)
        .bind(token.v_tokens)
        .bind(token.v_sol)
        .bind(token.market_cap_sol)
        .bind(token.created_at.timestamp_millis())
        .bind(&token.analysis)
        .bind(token.analysis_completed)
        .bind(token.analysis_timestamp.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .context("Failed to save token")?;

        debug!("Saved token {} ({})", token.symbol, token.address);
        Ok(())
    }

    async fn update_market_cap(
        &self,
        address: &str,
        market_cap_sol: f64,
    ) -> Result<Option<Token>> {
        let result = sqlx::query("UPDATE tokens SET market_cap_sol = ? WHERE address = ?")
            .bind(market_cap_sol)
            .bind(address)
            .execute(&self.pool)
            .await
            .context("Failed to update market cap")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(address).await
    }

    async fn update_analysis(&self, address: &str, analysis: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET analysis = ?, analysis_completed = TRUE, analysis_timestamp = ?
            WHERE address = ?
            "#,
        )
        .bind(analysis)
        .bind(Utc::now().timestamp_millis())
        .bind(address)
        .execute(&self.pool)
        .await
        .context("Failed to update analysis")?;

        if result.rows_affected() == 0 {
            bail!("No token with address {}", address);
        }
        Ok(())
    }
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<Pubkey, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, address: &str) -> Result<Option<Token>> {
        Ok(self.tokens.read().await.get(address).cloned())
    }

    async fn save(&self, token: &Token) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        let mut token = token.clone();
        if let Some(existing) = tokens.get(&token.address) {
            token.created_at = existing.created_at;
            token.analysis = existing.analysis.clone();
            token.analysis_completed = existing.analysis_completed;
            token.analysis_timestamp = existing.analysis_timestamp;
        }
        tokens.insert(token.address.clone(), token);
        Ok(())
    }

    async fn update_market_cap(
        &self,
        address: &str,
        market_cap_sol: f64,
    ) -> Result<Option<Token>> {
        let mut tokens = self.tokens.write().await;
        Ok(tokens.get_mut(address).map(|token| {
            token.market_cap_sol = market_cap_sol;
            token.clone()
        }))
    }

    async fn update_analysis(&self, address: &str, analysis: &str) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        let Some(token) = tokens.get_mut(address) else {
            bail!("No token with address {}", address);
        };
        token.analysis = Some(analysis.to_string());
        token.analysis_completed = true;
        token.analysis_timestamp = Some(Utc::now());
        Ok(())
    }
}
