// =============================================================================
// Live broker gateway — OAuth-bearer HTTP client with proactive token
// renewal and rate-limit/retry handling.
// =============================================================================
//
// Grounded on `original_source/src/etrade_client.py`. The OAuth1 handshake
// itself (`authenticate`, the request-token/verifier dance) is an interactive,
// one-time setup step performed out of band and is out of scope here — this
// client is constructed with an already-issued access token and is
// responsible only for using it, renewing it, and retrying around transient
// failures (`_request`'s 429/401/backoff handling).
//
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::types::{OrderStatus, OrderType, Side};

use super::{Account, BrokerGateway, OrderStatusResult, PlaceResult, PositionRow, PreviewResult};

const MAX_REQUEST_ATTEMPTS: u32 = 3;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

/// Live brokerage client. Holds a renewable bearer token behind a
/// `parking_lot::RwLock` so concurrent readers (e.g. a status-poll loop
/// racing a renewal) never block each other for longer than a copy.
pub struct LiveBroker {
    client: Client,
    base_url: String,
    account_id_key: String,
    access_token: RwLock<Option<String>>,
}

impl LiveBroker {
    pub fn new(base_url: impl Into<String>, account_id_key: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client"),
            base_url: base_url.into(),
            account_id_key: account_id_key.into(),
            access_token: RwLock::new(access_token),
        }
    }

    fn token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    /// Authenticated request with retry/backoff, mirroring
    /// `etrade_client.py::_request`: 429 honors `Retry-After`, 401 triggers
    /// one renewal-and-retry, transient network errors back off
    /// exponentially. All three share one attempt budget.
    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let Some(_) = self.token() else {
            bail!("live broker has no access token; not authenticated");
        };

        let url = format!("{}{path}", self.base_url);

        for attempt in 0..MAX_REQUEST_ATTEMPTS {
            let token = self.token().context("access token cleared mid-request")?;

            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query);
            if let Some(b) = &body {
                req = req.json(b);
            }

            let sent = req.send().await;

            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    if attempt + 1 >= MAX_REQUEST_ATTEMPTS {
                        return Err(e).context("request failed after max attempts");
                    }
                    let backoff = 2u64.pow(attempt);
                    warn!(attempt, backoff_secs = backoff, error = %e, "broker request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    continue;
                }
            };

            match resp.status() {
                StatusCode::TOO_MANY_REQUESTS => {
                    let wait = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS);
                    warn!(wait_secs = wait, "broker rate limited, waiting");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    warn!("broker token expired mid-request, attempting renewal");
                    if self.renew_token().await.is_ok() {
                        continue;
                    }
                    bail!("broker token expired and renewal failed");
                }
                s if s.is_success() => {
                    return resp.json().await.context("broker response was not valid JSON");
                }
                s => {
                    let text = resp.text().await.unwrap_or_default();
                    bail!("broker API error {s}: {text}");
                }
            }
        }

        bail!("broker request exhausted retries")
    }

    /// Proactively renew the access token. Tolerant of E*TRADE's "token
    /// extended, not replaced" response, which carries no new credentials.
    #[instrument(skip(self), name = "broker::renew_token")]
    pub async fn renew_token(&self) -> Result<()> {
        let token = self.token().context("no token to renew")?;

        let resp = self
            .client
            .get(format!("{}/oauth/renew_access_token", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .context("token renewal request failed")?;

        if !resp.status().is_success() {
            bail!("token renewal returned {}", resp.status());
        }

        let body = resp.text().await.unwrap_or_default();
        if let Some(new_token) = parse_renewed_token(&body) {
            *self.access_token.write() = Some(new_token);
            info!("access token renewed and replaced");
        } else {
            debug!("access token renewed (extended, no new credentials)");
        }
        Ok(())
    }
}

/// Parses E*TRADE's `oauth_token=XXX&oauth_token_secret=YYY` renewal body.
/// Returns `None` when the response carries no new token (token was simply
/// extended).
fn parse_renewed_token(body: &str) -> Option<String> {
    body.split('&')
        .find_map(|kv| kv.strip_prefix("oauth_token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn map_status(raw: &str) -> OrderStatus {
    match raw.to_ascii_uppercase().as_str() {
        "EXECUTED" => OrderStatus::Executed,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

#[async_trait]
impl BrokerGateway for LiveBroker {
    #[instrument(skip(self), name = "broker::is_authenticated")]
    async fn is_authenticated(&self) -> bool {
        let Some(token) = self.token() else {
            return false;
        };

        let resp = self
            .client
            .get(format!("{}/v1/accounts/list", self.base_url))
            .bearer_auth(&token)
            .send()
            .await;

        match resp {
            Ok(r) if r.status() == StatusCode::OK => true,
            Ok(r) if r.status() == StatusCode::UNAUTHORIZED => {
                warn!("broker token expired or invalid");
                false
            }
            Ok(r) => {
                warn!(status = %r.status(), "broker auth check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "broker auth check errored");
                false
            }
        }
    }

    #[instrument(skip(self), name = "broker::ensure_authenticated")]
    async fn ensure_authenticated(&self) -> Result<bool> {
        if !self.is_authenticated().await {
            return Ok(false);
        }

        match self.renew_token().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "token renewal failed during ensure_authenticated");
                Ok(self.is_authenticated().await)
            }
        }
    }

    #[instrument(skip(self), name = "broker::get_account")]
    async fn get_account(&self) -> Result<Account> {
        let body = self
            .request_json(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/balance", self.account_id_key),
                &[("instType", "BROKERAGE".to_string()), ("realTimeNAV", "true".to_string())],
                None,
            )
            .await?;

        let computed = &body["BalanceResponse"]["Computed"];
        let cash_available = computed["cashAvailableForInvestment"]
            .as_f64()
            .or_else(|| computed["cashBuyingPower"].as_f64())
            .unwrap_or(0.0);
        let portfolio_value = computed["netAccountValue"].as_f64().unwrap_or(cash_available);

        Ok(Account {
            account_id_key: self.account_id_key.clone(),
            cash_available,
            portfolio_value,
        })
    }

    #[instrument(skip(self), name = "broker::get_account_positions")]
    async fn get_account_positions(&self) -> Result<Vec<PositionRow>> {
        let body = self
            .request_json(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/portfolio", self.account_id_key),
                &[],
                None,
            )
            .await?;

        let positions = body["PortfolioResponse"]["AccountPortfolio"][0]["Position"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let rows = positions
            .iter()
            .filter_map(|p| {
                let symbol = p["Product"]["symbol"].as_str()?.to_string();
                let quantity = p["quantity"].as_f64()?;
                Some(PositionRow { symbol, quantity })
            })
            .collect();

        Ok(rows)
    }

    #[instrument(skip(self), name = "broker::preview_order")]
    async fn preview_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<PreviewResult> {
        let order = build_order_request(symbol, side, quantity, order_type, true);
        let body = self
            .request_json(
                reqwest::Method::POST,
                &format!("/v1/accounts/{}/orders/preview", self.account_id_key),
                &[],
                Some(order),
            )
            .await?;

        let preview = &body["PreviewOrderResponse"];
        let preview_id = preview["PreviewIds"][0]["previewId"]
            .as_str()
            .or_else(|| preview["PreviewIds"][0]["previewId"].as_i64().map(|_| "0"))
            .unwrap_or_default()
            .to_string();

        Ok(PreviewResult {
            preview_id,
            estimated_commission: preview["Order"][0]["estimatedCommission"].as_f64().unwrap_or(0.0),
            estimated_total: preview["Order"][0]["estimatedTotalAmount"].as_f64().unwrap_or(0.0),
        })
    }

    #[instrument(skip(self, preview), name = "broker::place_order")]
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
        preview: Option<&PreviewResult>,
    ) -> Result<PlaceResult> {
        let mut order = build_order_request(symbol, side, quantity, order_type, false);
        if let Some(p) = preview {
            order["PlaceOrderRequest"]["PreviewIds"] = json!([{ "previewId": p.preview_id }]);
        }

        let body = self
            .request_json(
                reqwest::Method::POST,
                &format!("/v1/accounts/{}/orders/place", self.account_id_key),
                &[],
                Some(order),
            )
            .await?;

        let placed = &body["PlaceOrderResponse"];
        let order_id = placed["OrderIds"][0]["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_default();

        Ok(PlaceResult { order_id, status: OrderStatus::Pending })
    }

    #[instrument(skip(self), name = "broker::get_order_status")]
    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult> {
        let body = self
            .request_json(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/orders/{order_id}", self.account_id_key),
                &[],
                None,
            )
            .await?;

        let order = &body["OrdersResponse"]["Order"][0];
        let detail = &order["OrderDetail"][0];
        let instrument = &detail["Instrument"][0];

        let status = map_status(order["OrderStatus"].as_str().unwrap_or(""));
        let filled_qty = instrument["filledQuantity"].as_f64().unwrap_or(0.0);
        let avg_fill_price = detail["averageExecutionPrice"].as_f64().unwrap_or(0.0);

        Ok(OrderStatusResult { status, filled_qty, avg_fill_price })
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.request_json(
            reqwest::Method::PUT,
            &format!("/v1/accounts/{}/orders/cancel", self.account_id_key),
            &[],
            Some(json!({ "CancelOrderRequest": { "orderId": order_id } })),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker::get_quote")]
    async fn get_quote(&self, symbol: &str) -> Result<f64> {
        let body = self
            .request_json(reqwest::Method::GET, &format!("/v1/market/quote/{symbol}"), &[], None)
            .await?;

        let quote_data = &body["QuoteResponse"]["QuoteData"][0]["All"];
        quote_data["lastTrade"]
            .as_f64()
            .context("broker quote missing lastTrade")
    }
}

fn build_order_request(symbol: &str, side: Side, quantity: f64, order_type: OrderType, preview: bool) -> Value {
    let action = match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    };
    let price_type = match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    };

    let order = json!({
        "allOrNone": "false",
        "priceType": price_type,
        "orderTerm": "GOOD_FOR_DAY",
        "marketSession": "REGULAR",
        "Instrument": [{
            "Product": { "securityType": "EQ", "symbol": symbol },
            "orderAction": action,
            "quantityType": "QUANTITY",
            "quantity": quantity,
        }],
    });

    let key = if preview { "PreviewOrderRequest" } else { "PlaceOrderRequest" };
    json!({
        key: {
            "orderType": "EQ",
            "clientOrderId": format!("etf_{}", uuid::Uuid::new_v4().simple()),
            "Order": [order],
        }
    })
}

impl std::fmt::Debug for LiveBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroker")
            .field("base_url", &self.base_url)
            .field("account_id_key", &self.account_id_key)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_renewed_token_extracts_new_token() {
        let body = "oauth_token=NEW123&oauth_token_secret=SECRET456";
        assert_eq!(parse_renewed_token(body), Some("NEW123".to_string()));
    }

    #[test]
    fn parse_renewed_token_handles_extended_not_replaced() {
        assert_eq!(parse_renewed_token(""), None);
        assert_eq!(parse_renewed_token("status=extended"), None);
    }

    #[test]
    fn map_status_recognizes_terminal_states() {
        assert_eq!(map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_status("CANCELLED"), OrderStatus::Cancelled);
        assert_eq!(map_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_status("OPEN"), OrderStatus::Pending);
    }
}
