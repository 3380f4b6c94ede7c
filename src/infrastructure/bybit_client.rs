//! Bybit v5 REST client for linear perpetuals.
//!
//! Private calls are signed with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + (query string | json body)`.

use crate::config::BybitCredentials;
use crate::domain::entities::directive::Side;
use crate::domain::errors::{UpstreamError, UpstreamErrorKind};
use crate::domain::repositories::exchange_client::{
    CloseAck, ExchangeClient, ExchangePosition, ExchangeResult, OrderAck, OrderRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const BYBIT_API_BASE: &str = "https://api.bybit.com";
const BYBIT_TESTNET_BASE: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: u64 = 5_000;
const CATEGORY: &str = "linear";

/// retCodes for bad key / signature / permissions
const AUTH_RET_CODES: [i64; 4] = [10003, 10004, 10005, 33004];
const RATE_LIMIT_RET_CODE: i64 = 10006;

pub struct BybitClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: zeroize::Zeroizing<String>,
}

impl BybitClient {
    pub fn new(credentials: &BybitCredentials, timeout: Duration) -> ExchangeResult<Self> {
        let base_url = if credentials.testnet {
            BYBIT_TESTNET_BASE
        } else {
            BYBIT_API_BASE
        };
        Self::with_base_url(credentials, base_url, timeout)
    }

    pub fn with_base_url(
        credentials: &BybitCredentials,
        base_url: &str,
        timeout: Duration,
    ) -> ExchangeResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::network("http_client", e.to_string()))?;
        info!("Bybit client targeting {}", base_url);
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn sign(&self, timestamp: i64, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| UpstreamError::rejected("sign", format!("failed to create signing key: {}", e)))?;
        mac.update(format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, payload).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn ensure_success(operation: &str, resp: &ApiResponse) -> ExchangeResult<()> {
        if resp.ret_code == 0 {
            return Ok(());
        }
        let message = format!("{} (code {})", resp.ret_msg, resp.ret_code);
        let kind = if AUTH_RET_CODES.contains(&resp.ret_code) {
            UpstreamErrorKind::Unauthorized
        } else if resp.ret_code == RATE_LIMIT_RET_CODE {
            UpstreamErrorKind::Status(429)
        } else {
            UpstreamErrorKind::Rejected
        };
        Err(UpstreamError::new(operation, kind, message))
    }

    async fn send<T>(&self, operation: &str, request: reqwest::RequestBuilder) -> ExchangeResult<T>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await.map_err(|e| {
            let mut error = UpstreamError::from(e);
            error.operation = operation.to_string();
            error
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::new(operation, UpstreamErrorKind::Status(status.as_u16()), body));
        }
        let resp: ApiResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::decode(operation, e.to_string()))?;
        Self::ensure_success(operation, &resp)?;
        serde_json::from_value(resp.result).map_err(|e| UpstreamError::decode(operation, e.to_string()))
    }

    async fn public_get<T>(&self, operation: &str, path: &str, query: &[(&str, &str)]) -> ExchangeResult<T>
    where
        T: DeserializeOwned,
    {
        let request = self.http.get(self.url(path)).query(query);
        self.send(operation, request).await
    }

    async fn signed_request<T>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Value,
    ) -> ExchangeResult<T>
    where
        T: DeserializeOwned,
    {
        let timestamp = Utc::now().timestamp_millis();
        let query_string = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query)
            .finish();
        let (payload, url) = if method == Method::GET {
            let url = if query_string.is_empty() {
                self.url(path)
            } else {
                format!("{}?{}", self.url(path), query_string)
            };
            (query_string, url)
        } else {
            (body.to_string(), self.url(path))
        };
        let signature = self.sign(timestamp, &payload)?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("Content-Type", "application/json");
        if method != Method::GET {
            request = request.body(payload);
        }
        self.send(operation, request).await
    }

    async fn open_position(&self, symbol: &str) -> ExchangeResult<Option<PositionItem>> {
        let list: ListResult<PositionItem> = self
            .signed_request(
                "get_position",
                Method::GET,
                "/v5/position/list",
                &[("category", CATEGORY), ("symbol", symbol)],
                Value::Null,
            )
            .await?;
        Ok(list
            .list
            .into_iter()
            .find(|p| p.size.parse::<f64>().map(|s| s.abs() > f64::EPSILON).unwrap_or(false)))
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let list: ListResult<TickerItem> = self
            .public_get("get_ticker", "/v5/market/tickers", &[("category", CATEGORY), ("symbol", symbol)])
            .await?;
        list.list
            .first()
            .and_then(|t| t.last_price.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| UpstreamError::decode("get_ticker", format!("no last price for {}", symbol)))
    }

    async fn lot_size(&self, symbol: &str) -> ExchangeResult<LotSize> {
        let list: ListResult<InstrumentItem> = self
            .public_get(
                "get_instrument",
                "/v5/market/instruments-info",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;
        let filter = list
            .list
            .into_iter()
            .next()
            .map(|i| i.lot_size_filter)
            .ok_or_else(|| UpstreamError::rejected("get_instrument", format!("unknown symbol {}", symbol)))?;
        Ok(LotSize {
            step: filter.qty_step.parse().unwrap_or(0.0),
            min: filter.min_order_qty.parse().unwrap_or(0.0),
        })
    }

    /// Average fill price of a just-submitted market order, when Bybit reports it
    async fn fill_price(&self, symbol: &str, order_id: &str) -> Option<f64> {
        let result: ExchangeResult<ListResult<OrderItem>> = self
            .signed_request(
                "get_order",
                Method::GET,
                "/v5/order/realtime",
                &[("category", CATEGORY), ("symbol", symbol), ("orderId", order_id)],
                Value::Null,
            )
            .await;
        match result {
            Ok(list) => list
                .list
                .first()
                .and_then(|o| o.avg_price.parse::<f64>().ok())
                .filter(|p| p.is_finite() && *p > 0.0),
            Err(e) => {
                debug!(symbol, order_id, "Fill price lookup failed: {}", e);
                None
            }
        }
    }

    async fn submit_market_order(
        &self,
        operation: &str,
        symbol: &str,
        side: Side,
        qty: &str,
        reduce_only: bool,
    ) -> ExchangeResult<String> {
        let payload = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": map_side(side),
            "orderType": "Market",
            "qty": qty,
            "reduceOnly": reduce_only,
        });
        let result: CreateOrderResult = self
            .signed_request(operation, Method::POST, "/v5/order/create", &[], payload)
            .await?;
        Ok(result.order_id)
    }
}

struct LotSize {
    step: f64,
    min: f64,
}

fn map_side(side: Side) -> &'static str {
    match side {
        Side::Long => "Buy",
        Side::Short | Side::Flat => "Sell",
    }
}

/// Round `qty` down to the instrument's step and format it without float noise
fn qty_string(qty: f64, step: f64) -> String {
    if step <= 0.0 {
        return format!("{:.6}", qty).trim_end_matches('0').trim_end_matches('.').to_string();
    }
    let steps = (qty / step + 1e-9).floor();
    let decimals = step_decimals(step);
    format!("{:.*}", decimals, steps * step)
}

fn step_decimals(step: f64) -> usize {
    let text = format!("{}", step);
    text.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0)
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<ExchangePosition> {
        let Some(item) = self.open_position(symbol).await? else {
            return Ok(ExchangePosition::flat());
        };
        let side = match item.side.as_str() {
            "Buy" => Side::Long,
            "Sell" => Side::Short,
            _ => Side::Flat,
        };
        Ok(ExchangePosition {
            side,
            size: item.size.parse::<f64>().unwrap_or(0.0).abs(),
            entry_price: item.avg_price.parse::<f64>().ok().filter(|p| *p > 0.0),
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck> {
        if order.side.is_flat() {
            return Err(UpstreamError::rejected("place_order", "cannot open a FLAT position"));
        }
        let price = self.last_price(&order.symbol).await?;
        let lot = self.lot_size(&order.symbol).await?;
        let raw_qty = order.notional / price;
        let qty = qty_string(raw_qty, lot.step);
        let qty_value: f64 = qty.parse().unwrap_or(0.0);
        if qty_value <= 0.0 || qty_value < lot.min {
            return Err(UpstreamError::rejected(
                "place_order",
                format!(
                    "notional {:.2} at {} is below the minimum order quantity {} for {}",
                    order.notional, price, lot.min, order.symbol
                ),
            ));
        }

        info!(
            symbol = %order.symbol,
            side = %order.side,
            qty = %qty,
            notional = order.notional,
            "Submitting Bybit market order"
        );
        let order_id = self
            .submit_market_order("place_order", &order.symbol, order.side, &qty, false)
            .await?;
        let avg_price = self.fill_price(&order.symbol, &order_id).await;
        Ok(OrderAck { order_id, avg_price })
    }

    async fn close_position(&self, symbol: &str) -> ExchangeResult<CloseAck> {
        let position = self.get_position(symbol).await?;
        if position.is_flat() {
            warn!(symbol, "Close requested but Bybit reports no position");
            return Ok(CloseAck {
                order_id: None,
                exit_price: None,
            });
        }

        let qty = qty_string(position.size, 0.0);
        let order_id = self
            .submit_market_order("close_position", symbol, position.side.opposite(), &qty, true)
            .await?;
        let exit_price = self.fill_price(symbol, &order_id).await;
        Ok(CloseAck {
            order_id: Some(order_id),
            exit_price,
        })
    }

    async fn get_account_equity(&self) -> ExchangeResult<f64> {
        let list: ListResult<WalletItem> = self
            .signed_request(
                "get_account_equity",
                Method::GET,
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED")],
                Value::Null,
            )
            .await?;
        list.list
            .first()
            .and_then(|w| w.total_equity.parse::<f64>().ok())
            .filter(|e| e.is_finite())
            .ok_or_else(|| UpstreamError::decode("get_account_equity", "no totalEquity in wallet balance"))
    }
}

/// Envelope of every v5 response; `result` is decoded only after `retCode` is checked
#[derive(Deserialize)]
struct ApiResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Deserialize)]
struct PositionItem {
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
}

#[derive(Deserialize)]
struct TickerItem {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Deserialize)]
struct InstrumentItem {
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
}

#[derive(Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
    #[serde(rename = "minOrderQty")]
    min_order_qty: String,
}

#[derive(Deserialize)]
struct OrderItem {
    #[serde(rename = "avgPrice")]
    avg_price: String,
}

#[derive(Deserialize)]
struct WalletItem {
    #[serde(rename = "totalEquity")]
    total_equity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use zeroize::Zeroizing;

    fn client(base: &str) -> BybitClient {
        let credentials = BybitCredentials {
            api_key: "test-key".to_string(),
            api_secret: Zeroizing::new("test-secret".to_string()),
            testnet: true,
        };
        BybitClient::with_base_url(&credentials, base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let client = client("http://localhost");
        let signature = client
            .sign(1_658_385_579_423, r#"{"category":"linear"}"#)
            .unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(
            signature,
            client.sign(1_658_385_579_423, r#"{"category":"linear"}"#).unwrap()
        );
        assert_ne!(signature, client.sign(1_658_385_579_424, r#"{"category":"linear"}"#).unwrap());
    }

    #[test]
    fn test_qty_rounding() {
        assert_eq!(qty_string(0.123456, 0.001), "0.123");
        assert_eq!(qty_string(12.9, 1.0), "12");
        assert_eq!(qty_string(0.5, 0.0), "0.5");
    }

    #[tokio::test]
    async fn test_get_position_maps_side() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v5/position/list")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("category".into(), "linear".into()),
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            ]))
            .match_header("X-BAPI-API-KEY", "test-key")
            .with_status(200)
            .with_body(
                r#"{"retCode":0,"retMsg":"OK","result":{"list":[
                    {"symbol":"BTCUSDT","side":"Sell","size":"0.015","avgPrice":"64000.5"}
                ]}}"#,
            )
            .create_async()
            .await;

        let position = client(&server.url()).get_position("BTCUSDT").await.unwrap();
        mock.assert_async().await;
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, 0.015);
        assert_eq!(position.entry_price, Some(64000.5));
    }

    #[tokio::test]
    async fn test_empty_position_is_flat() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/position/list")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"retCode":0,"retMsg":"OK","result":{"list":[
                    {"symbol":"BTCUSDT","side":"","size":"0","avgPrice":"0"}
                ]}}"#,
            )
            .create_async()
            .await;

        let position = client(&server.url()).get_position("BTCUSDT").await.unwrap();
        assert!(position.is_flat());
    }

    #[tokio::test]
    async fn test_place_order_sizes_from_notional() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/market/tickers")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"ETHUSDT","lastPrice":"2000"}]}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v5/market/instruments-info")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"retCode":0,"retMsg":"OK","result":{"list":[
                    {"symbol":"ETHUSDT","lotSizeFilter":{"qtyStep":"0.01","minOrderQty":"0.01"}}
                ]}}"#,
            )
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v5/order/create")
            .match_body(Matcher::PartialJsonString(
                r#"{"symbol":"ETHUSDT","side":"Buy","orderType":"Market","qty":"0.50","reduceOnly":false}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"ord-1","orderLinkId":""}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v5/order/realtime")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"orderId":"ord-1","avgPrice":"2001.5"}]}}"#)
            .create_async()
            .await;

        let ack = client(&server.url())
            .place_order(&OrderRequest {
                symbol: "ETHUSDT".to_string(),
                side: Side::Long,
                size_percent: 10.0,
                notional: 1000.0,
            })
            .await
            .unwrap();
        create.assert_async().await;
        assert_eq!(ack.order_id, "ord-1");
        assert_eq!(ack.avg_price, Some(2001.5));
    }

    #[tokio::test]
    async fn test_ret_code_maps_to_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/account/wallet-balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode":110007,"retMsg":"ab not enough for new order","result":{}}"#)
            .create_async()
            .await;

        let error = client(&server.url()).get_account_equity().await.unwrap_err();
        assert_eq!(error.kind, UpstreamErrorKind::Rejected);
        assert!(error.message.contains("110007"));
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn test_invalid_key_maps_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/account/wallet-balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode":10003,"retMsg":"API key is invalid.","result":{}}"#)
            .create_async()
            .await;

        let error = client(&server.url()).get_account_equity().await.unwrap_err();
        assert_eq!(error.kind, UpstreamErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_close_when_flat_is_noop() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v5/position/list")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"retCode":0,"retMsg":"OK","result":{"list":[]}}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v5/order/create")
            .expect(0)
            .create_async()
            .await;

        let ack = client(&server.url()).close_position("BTCUSDT").await.unwrap();
        create.assert_async().await;
        assert_eq!(ack.order_id, None);
        assert_eq!(ack.exit_price, None);
    }
}
