use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde_json::Value;

use crate::error::{BatchError, Error, RpcError};
use crate::rpc::transport::RpcTransport;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Aggregates JSON-RPC calls into single HTTP round trips.
#[derive(Debug)]
pub struct BatchClient<T> {
    transport: T,
}

impl<T: RpcTransport> BatchClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a single (non-batched) request.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        const CALL_ID: u64 = 1;
        let request = RpcRequest::new(method, params);
        let body = self.transport.send(request.to_envelope(CALL_ID)).await?;
        let response: RpcResponse = serde_json::from_value(body)
            .map_err(|e| Error::Decode(format!("{method}: malformed response: {e}")))?;
        if response.id != CALL_ID {
            return Err(BatchError::UnknownId(response.id).into());
        }
        response.into_result().map_err(|err| {
            Error::Rpc(RpcError {
                code: err.code,
                message: err.message,
                method: method.to_string(),
                position: 0,
            })
        })
    }

    /// Send all requests in one round trip and return their results in the
    /// caller's order.
    ///
    /// Responses are correlated by id only; wire order is ignored. The first
    /// failing entry in id order aborts the whole batch.
    pub async fn batch(&self, requests: &[RpcRequest]) -> Result<Vec<Value>, Error> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids = assign_ids(requests)?;
        let payload = Value::Array(
            requests
                .iter()
                .zip(&ids)
                .map(|(request, id)| request.to_envelope(*id))
                .collect(),
        );

        tracing::debug!(size = requests.len(), "sending rpc batch");
        let body = self.transport.send(payload).await?;

        let Value::Array(entries) = body else {
            return Err(BatchError::NotAnArray.into());
        };
        if entries.len() != requests.len() {
            return Err(BatchError::CountMismatch {
                expected: requests.len(),
                actual: entries.len(),
            }
            .into());
        }

        let mut responses = entries
            .into_iter()
            .map(|entry| {
                serde_json::from_value::<RpcResponse>(entry)
                    .map_err(|e| BatchError::MalformedResponse(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        responses.sort_by_key(|r| r.id);

        let position_of: HashMap<u64, usize> =
            ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
        let mut results: Vec<Option<Value>> = vec![None; requests.len()];

        for response in responses {
            let id = response.id;
            let pos = *position_of.get(&id).ok_or(BatchError::UnknownId(id))?;
            if results[pos].is_some() {
                return Err(BatchError::DuplicateId(id).into());
            }
            match response.into_result() {
                Ok(value) => results[pos] = Some(value),
                Err(err) => {
                    return Err(RpcError {
                        code: err.code,
                        message: err.message,
                        method: requests[pos].method.clone(),
                        position: pos,
                    }
                    .into())
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.unwrap_or(Value::Null))
            .collect())
    }

    /// Like [`batch`](Self::batch) but never fails.
    ///
    /// This is all-or-nothing: any failure, including a single item's RPC
    /// error, yields `None` for every position. There is no per-item recovery.
    pub async fn batch_safe(&self, requests: &[RpcRequest]) -> Vec<Option<Value>> {
        match self.batch(requests).await {
            Ok(values) => values.into_iter().map(Some).collect(),
            Err(e) => {
                tracing::warn!(size = requests.len(), error = %e, "batch failed, degrading to nulls");
                vec![None; requests.len()]
            }
        }
    }

    /// Split `items` into batches of at most `max_per_batch`, issued one after
    /// another, and merge the results by item.
    ///
    /// A chunk that fails drops its items from the result.
    pub async fn batch_chunked<K, F>(
        &self,
        items: &[K],
        max_per_batch: usize,
        build: F,
    ) -> HashMap<K, Value>
    where
        K: Eq + Hash + Clone,
        F: Fn(&K) -> RpcRequest,
    {
        let mut merged = HashMap::with_capacity(items.len());

        for (index, chunk) in items.chunks(max_per_batch.max(1)).enumerate() {
            let requests: Vec<RpcRequest> = chunk.iter().map(&build).collect();
            match self.batch(&requests).await {
                Ok(values) => {
                    for (item, value) in chunk.iter().zip(values) {
                        merged.insert(item.clone(), value);
                    }
                }
                Err(e) => {
                    tracing::warn!(chunk = index, size = chunk.len(), error = %e, "dropping failed chunk");
                }
            }
        }

        merged
    }
}

/// Ids for each request: explicit ones are kept, missing ones get their
/// 1-based position.
fn assign_ids(requests: &[RpcRequest]) -> Result<Vec<u64>, BatchError> {
    let mut seen = HashSet::with_capacity(requests.len());
    let mut ids = Vec::with_capacity(requests.len());
    for (pos, request) in requests.iter().enumerate() {
        let id = request.id.unwrap_or(pos as u64 + 1);
        if !seen.insert(id) {
            return Err(BatchError::DuplicateId(id));
        }
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::TransportError;
    use crate::rpc::transport::HandlerTransport;

    /// Answers every request with its first param, in reversed wire order.
    pub(crate) fn echo_reversed(payload: &Value) -> Result<Value, TransportError> {
        let Value::Array(requests) = payload else {
            let id = payload["id"].clone();
            return Ok(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": payload["params"][0]}));
        };
        let mut out: Vec<Value> = requests
            .iter()
            .map(|r| serde_json::json!({"jsonrpc": "2.0", "id": r["id"], "result": r["params"][0]}))
            .collect();
        out.reverse();
        Ok(Value::Array(out))
    }

    fn requests(n: usize) -> Vec<RpcRequest> {
        (0..n)
            .map(|i| RpcRequest::new("eth_getTokenDetails", vec![serde_json::json!(i)]))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_restores_caller_order() {
        let client = BatchClient::new(HandlerTransport::new(echo_reversed));
        let results = client.batch(&requests(5)).await.unwrap();
        assert_eq!(results.len(), 5);
        for (i, value) in results.iter().enumerate() {
            assert_eq!(value, &serde_json::json!(i));
        }
        assert_eq!(client.transport().calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_assigns_positional_ids() {
        let transport = Arc::new(HandlerTransport::new(echo_reversed));
        let client = BatchClient::new(transport.clone());
        let mut reqs = requests(3);
        reqs[1].id = Some(40);
        client.batch(&reqs).await.unwrap();

        let sent = &transport.payloads()[0];
        let ids: Vec<u64> = sent
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 40, 3]);
        assert_eq!(sent[0]["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn test_batch_rejects_duplicate_ids() {
        let client = BatchClient::new(HandlerTransport::new(echo_reversed));
        let mut reqs = requests(2);
        reqs[1].id = Some(1);
        let err = client.batch(&reqs).await.unwrap_err();
        assert!(matches!(err, Error::Batch(BatchError::DuplicateId(1))));
        assert_eq!(client.transport().calls(), 0);
    }

    fn fail_second(payload: &Value) -> Result<Value, TransportError> {
        let requests = payload.as_array().unwrap();
        Ok(Value::Array(
            requests
                .iter()
                .map(|r| {
                    if r["id"] == 2 {
                        serde_json::json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32000, "message": "boom"}})
                    } else {
                        serde_json::json!({"jsonrpc": "2.0", "id": r["id"], "result": "ok"})
                    }
                })
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_strict_batch_aborts_on_item_error() {
        let client = BatchClient::new(HandlerTransport::new(fail_second));
        let err = client.batch(&requests(4)).await.unwrap_err();
        match err {
            Error::Rpc(rpc) => {
                assert_eq!(rpc.code, -32000);
                assert_eq!(rpc.position, 1);
                assert_eq!(rpc.method, "eth_getTokenDetails");
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_safe_batch_is_all_or_nothing() {
        // One bad item nulls out the three good ones as well.
        let client = BatchClient::new(HandlerTransport::new(fail_second));
        let results = client.batch_safe(&requests(4)).await;
        assert_eq!(results, vec![None, None, None, None]);
    }

    #[tokio::test]
    async fn test_safe_batch_passes_through_success() {
        let client = BatchClient::new(HandlerTransport::new(echo_reversed));
        let results = client.batch_safe(&requests(2)).await;
        assert_eq!(results, vec![Some(serde_json::json!(0)), Some(serde_json::json!(1))]);
    }

    #[tokio::test]
    async fn test_batch_shape_errors() {
        let client = BatchClient::new(HandlerTransport::new(|_| Ok(serde_json::json!({"id": 1}))));
        let err = client.batch(&requests(1)).await.unwrap_err();
        assert!(matches!(err, Error::Batch(BatchError::NotAnArray)));

        let client = BatchClient::new(HandlerTransport::new(|_| {
            Ok(serde_json::json!([{"jsonrpc": "2.0", "id": 1, "result": 1}]))
        }));
        let err = client.batch(&requests(2)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Batch(BatchError::CountMismatch { expected: 2, actual: 1 })
        ));

        let client = BatchClient::new(HandlerTransport::new(|_| {
            Ok(serde_json::json!([{"jsonrpc": "2.0", "id": 9, "result": 1}]))
        }));
        let err = client.batch(&requests(1)).await.unwrap_err();
        assert!(matches!(err, Error::Batch(BatchError::UnknownId(9))));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let client = BatchClient::new(HandlerTransport::new(|_| {
            Err(TransportError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        }));
        let err = client.batch(&requests(1)).await.unwrap_err();
        assert_eq!(err.http_status(), Some(502));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_network() {
        let client = BatchClient::new(HandlerTransport::new(echo_reversed));
        assert!(client.batch(&[]).await.unwrap().is_empty());
        assert_eq!(client.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_single_call() {
        let client = BatchClient::new(HandlerTransport::new(echo_reversed));
        let value = client.call("eth_chainId", vec![serde_json::json!("0xa410")]).await.unwrap();
        assert_eq!(value, "0xa410");
    }

    #[tokio::test]
    async fn test_single_call_checks_response_id() {
        let client = BatchClient::new(HandlerTransport::new(|_| {
            Ok(serde_json::json!({"jsonrpc": "2.0", "id": 9, "result": "0x1"}))
        }));
        let err = client.call("eth_blockNumber", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Batch(BatchError::UnknownId(9))));
    }

    #[tokio::test]
    async fn test_chunked_issues_sequential_batches() {
        let transport = Arc::new(HandlerTransport::new(echo_reversed));
        let client = BatchClient::new(transport.clone());
        let items: Vec<u64> = (0..120).collect();

        let merged = client
            .batch_chunked(&items, 50, |i| {
                RpcRequest::new("eth_getTokenDetails", vec![serde_json::json!(i)])
            })
            .await;

        let sizes: Vec<usize> = transport
            .payloads()
            .iter()
            .map(|p| p.as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(merged.len(), 120);
        assert_eq!(merged[&119], serde_json::json!(119));
        // Second chunk starts where the first ended.
        assert_eq!(transport.payloads()[1][0]["params"][0], 50);
    }

    #[tokio::test]
    async fn test_chunked_drops_failed_chunk_only() {
        let transport = Arc::new(HandlerTransport::new(|payload| {
            let first = payload[0]["params"][0].as_u64().unwrap_or(0);
            if first == 50 {
                Err(TransportError::Network("connection reset".to_string()))
            } else {
                echo_reversed(payload)
            }
        }));
        let client = BatchClient::new(transport.clone());
        let items: Vec<u64> = (0..120).collect();

        let merged = client
            .batch_chunked(&items, 50, |i| {
                RpcRequest::new("eth_getTokenDetails", vec![serde_json::json!(i)])
            })
            .await;

        assert_eq!(transport.calls(), 3);
        assert_eq!(merged.len(), 70);
        assert!(merged.contains_key(&49));
        assert!(!merged.contains_key(&50));
        assert!(!merged.contains_key(&99));
        assert!(merged.contains_key(&100));
    }
}
