//! HTTP transport for JSON-RPC payloads.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, TransportError};

/// Sends a JSON-RPC payload (a single object or a batch array) and returns
/// the decoded JSON body.
///
/// Transports do not interpret JSON-RPC `error` fields and never retry.
pub trait RpcTransport: Send + Sync {
    fn send(&self, payload: Value) -> impl Future<Output = Result<Value, TransportError>> + Send;
}

impl<T: RpcTransport> RpcTransport for Arc<T> {
    fn send(&self, payload: Value) -> impl Future<Output = Result<Value, TransportError>> + Send {
        (**self).send(payload)
    }
}

/// `reqwest`-backed transport with a fixed request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl RpcTransport for HttpTransport {
    async fn send(&self, payload: Value) -> Result<Value, TransportError> {
        let response = self.client.post(&self.url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), url = %self.url, "rpc request rejected");
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidBody(e.to_string()))
    }
}

type Handler = dyn Fn(&Value) -> Result<Value, TransportError> + Send + Sync;

/// In-memory transport answering payloads with a closure.
///
/// Records every payload it receives and can simulate network latency.
pub struct HandlerTransport {
    handler: Box<Handler>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

impl HandlerTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: None,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of payloads sent so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every payload received, in send order.
    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }
}

impl RpcTransport for HandlerTransport {
    async fn send(&self, payload: Value) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().push(payload.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_transport_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"method": "eth_blockNumber"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), Duration::from_secs(5)).unwrap();
        let body = transport
            .send(serde_json::json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1}))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(body["result"], "0x10");
    }

    #[tokio::test]
    async fn test_http_transport_non_2xx_is_status_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = transport.send(serde_json::json!({})).await.unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_transport_does_not_interpret_rpc_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), Duration::from_secs(5)).unwrap();
        let body = transport.send(serde_json::json!({})).await.unwrap();
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_http_transport_invalid_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = transport.send(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidBody(_)));
    }

    #[tokio::test]
    async fn test_handler_transport_records_calls() {
        let transport = HandlerTransport::new(|payload| Ok(payload.clone()));
        let echoed = transport.send(serde_json::json!([1, 2])).await.unwrap();
        assert_eq!(echoed, serde_json::json!([1, 2]));
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.payloads().len(), 1);
    }
}
