//! Signed REST client for Binance USDⓈ-M futures. Account endpoints go to
//! the (testnet) futures base; unauthenticated tickers go to the public
//! market-data host.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::info;

use crate::config::BinanceConfig;
use crate::exchange::api::ExchangeInterface;
use crate::exchange::types::{OrderAck, OrderRequest, RemotePosition, SymbolFilters};

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceFutures {
    http: reqwest::Client,
    futures_url: String,
    market_data_url: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(rename = "totalWalletBalance")]
    total_wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct PositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderAck {
    #[serde(rename = "orderId")]
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
}

impl BinanceFutures {
    pub fn new(cfg: &BinanceConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            reqwest::header::HeaderValue::from_str(&cfg.api_key)
                .context("invalid api key header")?,
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .context("failed to build exchange http client")?;

        info!("🔗 Binance futures client initialized ({})", cfg.futures_url);
        Ok(Self {
            http,
            futures_url: cfg.futures_url.clone(),
            market_data_url: cfg.market_data_url.clone(),
            api_secret: cfg.api_secret.clone(),
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| anyhow!("invalid api secret"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));
        let signature = self.sign(&query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("exchange returned {}: {}", status, body));
        }
        resp.json::<T>().await.context("exchange response not valid JSON")
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T> {
        let url = if query.is_empty() {
            format!("{}{}", self.futures_url, path)
        } else {
            format!("{}{}?{}", self.futures_url, path, query)
        };
        Self::parse(self.http.get(url).send().await.context("exchange GET failed")?).await
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.get(path, &self.signed_query(params)?).await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}?{}", self.futures_url, path, self.signed_query(params)?);
        Self::parse(self.http.post(url).send().await.context("exchange POST failed")?).await
    }

    async fn signed_delete(&self, path: &str, params: &[(&str, String)]) -> Result<()> {
        let url = format!("{}{}?{}", self.futures_url, path, self.signed_query(params)?);
        let resp = self.http.delete(url).send().await.context("exchange DELETE failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("exchange returned {}: {}", status, body));
        }
        Ok(())
    }
}

fn parse_f64(raw: &str, what: &str) -> Result<f64> {
    raw.parse::<f64>()
        .with_context(|| format!("unparseable {what}: {raw}"))
}

#[async_trait]
impl ExchangeInterface for BinanceFutures {
    async fn balance(&self) -> Result<f64> {
        let account: AccountInfo = self.signed_get("/fapi/v2/account", &[]).await?;
        parse_f64(&account.total_wallet_balance, "wallet balance")
    }

    async fn price(&self, symbol: &str) -> Result<f64> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.market_data_url, symbol
        );
        let ticker: TickerPrice =
            Self::parse(self.http.get(url).send().await.context("ticker GET failed")?).await?;
        parse_f64(&ticker.price, "ticker price")
    }

    async fn positions(&self) -> Result<Vec<RemotePosition>> {
        let raw: Vec<PositionRisk> = self.signed_get("/fapi/v2/positionRisk", &[]).await?;
        let mut out = Vec::with_capacity(raw.len());
        for pos in raw {
            let qty = parse_f64(&pos.position_amt, "position amount")?.abs();
            let mark_price = pos.mark_price.parse::<f64>().unwrap_or(0.0);
            out.push(RemotePosition { symbol: pos.symbol, qty, mark_price });
        }
        Ok(out)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
        ];
        if order.order_type == crate::exchange::types::OrderType::Limit {
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(qty) = order.quantity {
            params.push(("quantity", format!("{qty}")));
        }
        if let Some(price) = order.price {
            params.push(("price", format!("{price}")));
        }
        if let Some(stop) = order.stop_price {
            params.push(("stopPrice", format!("{stop}")));
        }
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if order.close_position {
            params.push(("closePosition", "true".to_string()));
        }

        let ack: RawOrderAck = self.signed_post("/fapi/v1/order", &params).await?;
        Ok(OrderAck { order_id: ack.order_id.to_string() })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.signed_delete("/fapi/v1/allOpenOrders", &[("symbol", symbol.to_string())])
            .await
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let info: ExchangeInfo = self.get("/fapi/v1/exchangeInfo", "").await?;
        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| anyhow!("unknown symbol {symbol}"))?;

        let mut filters = SymbolFilters::default();
        for f in sym.filters {
            match f.filter_type.as_str() {
                "LOT_SIZE" => {
                    if let Some(step) = f.step_size.as_deref().and_then(|s| s.parse::<Decimal>().ok()) {
                        filters.step_size = step;
                    }
                }
                "PRICE_FILTER" => {
                    if let Some(tick) = f.tick_size.as_deref().and_then(|s| s.parse::<Decimal>().ok()) {
                        filters.tick_size = tick;
                    }
                }
                _ => {}
            }
        }
        Ok(filters)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let _: serde_json::Value = self
            .signed_post(
                "/fapi/v1/leverage",
                &[("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            )
            .await?;
        info!("⚙️ Leverage set to {}x for {}", leverage, symbol);
        Ok(())
    }
}
