//! Educational video collections minted on Stargaze.
//!
//! [`CollectionService`] polls the collection contract through a
//! [`ContractQuerier`], keeps the last good result and wakes subscribers only
//! when the result actually changed. Query failures are logged and the cached
//! collections stay as they were.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

const MICRO_UNITS: f64 = 1_000_000.0;
const DEFAULT_DENOM: &str = "STARS";

/// Read-only access to CosmWasm contracts.
#[async_trait]
pub trait ContractQuerier: Send + Sync {
    /// Run a smart query and return the contract's answer.
    async fn query_smart(&self, contract: &str, query: &Value) -> Result<Value>;
}

/// Smart queries over the Cosmos LCD REST API.
pub struct LcdQuerier {
    client: reqwest::Client,
    base_url: String,
}

impl LcdQuerier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

pub(crate) fn smart_query_path(contract: &str, query: &Value) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE.encode(query.to_string());
    format!("/cosmwasm/wasm/v1/contract/{contract}/smart/{encoded}")
}

#[async_trait]
impl ContractQuerier for LcdQuerier {
    async fn query_smart(&self, contract: &str, query: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, smart_query_path(contract, query));
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        body.get("data")
            .cloned()
            .ok_or_else(|| ClientError::Query(format!("no data in smart query reply from {contract}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintStatus {
    Active,
    Ended,
    Upcoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Rumble,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: String,
    pub denom: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintInfo {
    pub price: Price,
    pub total_supply: u64,
    pub minted_count: u64,
    pub mint_status: MintStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub contract_address: String,
    pub name: String,
    pub description: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub creator: Creator,
    pub duration: String,
    pub mint_info: MintInfo,
    pub topics: Vec<String>,
    pub platform: Platform,
}

/// Mint parameters read from the minter's `config` query.
#[derive(Debug, Clone, PartialEq)]
pub struct MintConfig {
    /// `"<amount> STARS"`, or `"TBA"` without a unit price.
    pub price: String,
    pub max_tokens: u64,
    pub minted_tokens: u64,
    pub status: MintStatus,
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text<'a>(metadata: &'a Value, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Micro-unit price as a display amount: `1500000` becomes `"1.5 STARS"`.
fn format_price(unit_price: Option<&Value>) -> String {
    let micro = match unit_price {
        Some(Value::Object(coin)) => as_u64(coin.get("amount")),
        other => as_u64(other),
    };
    match micro {
        Some(micro) => format!("{} {DEFAULT_DENOM}", micro as f64 / MICRO_UNITS),
        None => "TBA".to_string(),
    }
}

/// Interpret a minter `config` reply at time `now`.
pub fn mint_config(config: &Value, now: DateTime<Utc>) -> MintConfig {
    let max_tokens = as_u64(config.get("num_tokens")).unwrap_or(0);
    let minted_tokens = as_u64(config.get("token_count")).unwrap_or(0);
    let starts_later = as_u64(config.get("start_time"))
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
        .is_some_and(|start| start > now);

    let status = if starts_later {
        MintStatus::Upcoming
    } else if minted_tokens >= max_tokens {
        MintStatus::Ended
    } else {
        MintStatus::Active
    };

    MintConfig {
        price: format_price(config.get("unit_price")),
        max_tokens,
        minted_tokens,
        status,
    }
}

/// Assemble the collection from `contract_info` metadata and the mint config
/// (if it could be read).
pub fn build_collection(contract: &str, metadata: &Value, mint: Option<&MintConfig>) -> Collection {
    let creator = as_text(metadata, "creator");

    let (amount, denom) = match mint {
        Some(mint) => {
            let mut parts = mint.price.split(' ');
            (
                parts.next().unwrap_or("0").to_string(),
                parts.next().unwrap_or(DEFAULT_DENOM).to_string(),
            )
        }
        None => ("0".to_string(), DEFAULT_DENOM.to_string()),
    };

    let topics = match metadata.get("attributes").and_then(Value::as_array) {
        Some(attributes) => attributes
            .iter()
            .filter_map(|attr| attr.get("value"))
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect(),
        None => vec!["education".to_string(), "cosmos".to_string()],
    };

    let youtube_url = as_text(metadata, "youtube_url");

    Collection {
        contract_address: contract.to_string(),
        name: as_text(metadata, "name").unwrap_or("Educational Video").to_string(),
        description: as_text(metadata, "description")
            .unwrap_or("Learn about the Cosmos ecosystem")
            .to_string(),
        video_url: as_text(metadata, "animation_url")
            .or(youtube_url)
            .unwrap_or_default()
            .to_string(),
        thumbnail_url: as_text(metadata, "image")
            .unwrap_or("/path/to/default-thumbnail.jpg")
            .to_string(),
        creator: Creator {
            name: creator.unwrap_or("SNAILS DAO").to_string(),
            link: format!("/creator/{}", creator.unwrap_or("snails-dao")),
        },
        duration: as_text(metadata, "duration").unwrap_or("00:00").to_string(),
        mint_info: MintInfo {
            price: Price { amount, denom },
            total_supply: mint.map(|m| m.max_tokens).unwrap_or(0),
            minted_count: mint.map(|m| m.minted_tokens).unwrap_or(0),
            mint_status: mint.map(|m| m.status).unwrap_or(MintStatus::Upcoming),
        },
        topics,
        platform: if youtube_url.is_some() {
            Platform::Youtube
        } else {
            Platform::Rumble
        },
    }
}

pub struct CollectionService {
    querier: Arc<dyn ContractQuerier>,
    contract: String,
    latest: watch::Sender<Vec<Collection>>,
}

impl CollectionService {
    pub fn new(querier: Arc<dyn ContractQuerier>, contract: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(Vec::new());
        Self {
            querier,
            contract: contract.into(),
            latest,
        }
    }

    /// Service over the LCD endpoint and contract in `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let querier = LcdQuerier::new(config.lcd_url.clone(), config.request_timeout)?;
        Ok(Self::new(Arc::new(querier), config.collection_contract.clone()))
    }

    /// Query the contract now, without touching the cache.
    pub async fn fetch_latest(&self) -> Result<Vec<Collection>> {
        let info_query = json!({ "contract_info": {} });
        let config_query = json!({ "config": {} });
        let (metadata, config) = tokio::join!(
            self.querier.query_smart(&self.contract, &info_query),
            self.querier.query_smart(&self.contract, &config_query),
        );
        let metadata = metadata?;

        let mint = match config {
            Ok(config) => Some(mint_config(&config, Utc::now())),
            Err(e) => {
                warn!(contract = %self.contract, error = %e, "Failed to read mint config");
                None
            }
        };

        Ok(vec![build_collection(&self.contract, &metadata, mint.as_ref())])
    }

    /// Fetch and replace the cached collections. Returns whether they changed;
    /// subscribers are only woken on a change.
    pub async fn refresh(&self) -> Result<bool> {
        let fresh = self.fetch_latest().await?;
        let changed = self.latest.send_if_modified(|current| {
            if *current == fresh {
                false
            } else {
                *current = fresh;
                true
            }
        });
        if changed {
            info!(contract = %self.contract, "Collection data changed");
        }
        Ok(changed)
    }

    /// Last good collections, empty until the first successful refresh.
    pub fn collections(&self) -> Vec<Collection> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Collection>> {
        self.latest.subscribe()
    }

    /// Cached collections whose name, description or creator contains
    /// `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<Collection> {
        let query = query.to_lowercase();
        self.latest
            .borrow()
            .iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&query)
                    || c.description.to_lowercase().contains(&query)
                    || c.creator.name.to_lowercase().contains(&query)
            })
            .cloned()
            .collect()
    }

    /// Refresh every `period` until the handle is aborted.
    pub fn spawn_polling(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(changed) => debug!(changed, "Polled collections"),
                    Err(e) => warn!(contract = %self.contract, error = %e, "Collection poll failed"),
                }
            }
        })
    }
}
