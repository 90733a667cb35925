use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Price and logo for one symbol.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceRow {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub logo: String,
}

/// Off-chain price/metadata provider, keyed by lowercase symbol.
pub trait PriceSource: Send + Sync {
    fn fetch_token_data(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = Result<HashMap<String, PriceRow>, Error>> + Send;
}

impl<P: PriceSource> PriceSource for Arc<P> {
    fn fetch_token_data(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = Result<HashMap<String, PriceRow>, Error>> + Send {
        (**self).fetch_token_data(symbols)
    }
}

#[derive(Debug, Deserialize)]
struct TokenDataResponse {
    #[serde(default)]
    data: HashMap<String, PriceRow>,
}

/// HTTP price service: `GET {base}/token-data?symbols=a,b`.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl PriceSource for HttpPriceSource {
    async fn fetch_token_data(&self, symbols: &[String]) -> Result<HashMap<String, PriceRow>, Error> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/token-data", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.join(","))])
            .send()
            .await
            .map_err(|e| Error::Price(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Price(format!(
                "price service returned {}",
                response.status()
            )));
        }

        let body: TokenDataResponse = response
            .json()
            .await
            .map_err(|e| Error::Price(format!("malformed price response: {e}")))?;

        Ok(body
            .data
            .into_iter()
            .map(|(symbol, row)| (symbol.to_lowercase(), row))
            .collect())
    }
}

/// In-memory price source for testing and offline use.
#[derive(Debug, Default)]
pub struct StaticPriceSource {
    rows: HashMap<String, PriceRow>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose every lookup fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, symbol: &str, price: f64, logo: &str) {
        self.rows.insert(
            symbol.to_lowercase(),
            PriceRow {
                price,
                logo: logo.to_string(),
            },
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PriceSource for StaticPriceSource {
    async fn fetch_token_data(&self, symbols: &[String]) -> Result<HashMap<String, PriceRow>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Price("price source unavailable".to_string()));
        }
        Ok(symbols
            .iter()
            .filter_map(|s| {
                let key = s.to_lowercase();
                self.rows.get(&key).cloned().map(|row| (key, row))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_price_source() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/token-data")
            .match_query(mockito::Matcher::UrlEncoded(
                "symbols".into(),
                "eth,usdt".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "data": {
                        "ETH": {"price": 3000.5, "logo": "https://logos.example/eth.png"},
                        "usdt": {"price": 1.0}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let source = HttpPriceSource::new(format!("{}/", server.url()), Duration::from_secs(5)).unwrap();
        let rows = source
            .fetch_token_data(&["eth".to_string(), "usdt".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(rows["eth"].price, 3000.5);
        assert_eq!(rows["eth"].logo, "https://logos.example/eth.png");
        assert_eq!(rows["usdt"].logo, "");
    }

    #[tokio::test]
    async fn test_http_price_source_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/token-data")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let source = HttpPriceSource::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = source.fetch_token_data(&["eth".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Price(_)));
    }

    #[tokio::test]
    async fn test_http_price_source_skips_empty_request() {
        // No mock registered: any request would fail.
        let source = HttpPriceSource::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        assert!(source.fetch_token_data(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_price_source() {
        let mut source = StaticPriceSource::new();
        source.insert("HLS", 0.25, "");
        let rows = source
            .fetch_token_data(&["hls".to_string(), "unknown".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["hls"].price, 0.25);
        assert!(StaticPriceSource::failing()
            .fetch_token_data(&["hls".to_string()])
            .await
            .is_err());
    }
}
