//! Typed node methods.
//!
//! The batch engine treats method names as opaque strings; this module pairs
//! each method the portal uses with its parameters and a decoder that
//! validates the result shape.

use num_bigint::BigUint;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::address::Address;
use crate::enrich::proposal::ProposalRecord;
use crate::enrich::token::{TokenHolding, TokenMetadataRecord};
use crate::enrich::validator::{DelegationRecord, ValidatorRecord};
use crate::error::Error;
use crate::numeric;
use crate::rpc::batch::BatchClient;
use crate::rpc::transport::RpcTransport;
use crate::rpc::types::RpcRequest;

pub const BLOCK_NUMBER: &str = "eth_blockNumber";
pub const GAS_PRICE: &str = "eth_gasPrice";
pub const TOKEN_DETAILS: &str = "eth_getTokenDetails";
pub const ACCOUNT_TOKEN_BALANCES: &str = "eth_getAccountTokensBalanceByPageAndSize";
pub const VALIDATORS: &str = "eth_getValidatorsByPageAndSize";
pub const DELEGATIONS: &str = "eth_getDelegations";
pub const PROPOSALS: &str = "eth_getProposalsByPageAndSize";

/// A call to one of the node methods the portal consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    BlockNumber,
    GasPrice,
    TokenDetails(Address),
    AccountTokenBalances { owner: Address, page: u64, size: u64 },
    Validators { page: u64, size: u64 },
    Delegations(Address),
    Proposals { page: u64, size: u64 },
}

/// Decoded result of an [`RpcCall`], one variant per method.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutput {
    BlockNumber(u64),
    GasPrice(BigUint),
    /// `None` when the node does not know the token.
    TokenDetails(Option<TokenMetadataRecord>),
    AccountTokenBalances(Vec<TokenHolding>),
    Validators(Vec<ValidatorRecord>),
    Delegations(Vec<DelegationRecord>),
    Proposals(Vec<ProposalRecord>),
}

fn hex_page(n: u64) -> Value {
    Value::String(format!("0x{n:x}"))
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::BlockNumber => BLOCK_NUMBER,
            RpcCall::GasPrice => GAS_PRICE,
            RpcCall::TokenDetails(_) => TOKEN_DETAILS,
            RpcCall::AccountTokenBalances { .. } => ACCOUNT_TOKEN_BALANCES,
            RpcCall::Validators { .. } => VALIDATORS,
            RpcCall::Delegations(_) => DELEGATIONS,
            RpcCall::Proposals { .. } => PROPOSALS,
        }
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            RpcCall::BlockNumber | RpcCall::GasPrice => vec![],
            RpcCall::TokenDetails(address) | RpcCall::Delegations(address) => {
                vec![json!(address.to_lower_hex())]
            }
            RpcCall::AccountTokenBalances { owner, page, size } => {
                vec![json!(owner.to_lower_hex()), hex_page(*page), hex_page(*size)]
            }
            RpcCall::Validators { page, size } | RpcCall::Proposals { page, size } => {
                vec![hex_page(*page), hex_page(*size)]
            }
        }
    }

    pub fn to_request(&self) -> RpcRequest {
        RpcRequest::new(self.method(), self.params())
    }

    /// Validate and decode a raw result for this call.
    pub fn decode(&self, value: Value) -> Result<RpcOutput, Error> {
        let method = self.method();
        Ok(match self {
            RpcCall::BlockNumber => RpcOutput::BlockNumber(decode_u64_quantity(method, &value)?),
            RpcCall::GasPrice => RpcOutput::GasPrice(decode_quantity(method, &value)?),
            RpcCall::TokenDetails(_) => RpcOutput::TokenDetails(decode_optional(method, value)?),
            RpcCall::AccountTokenBalances { .. } => {
                RpcOutput::AccountTokenBalances(decode_list(method, value)?)
            }
            RpcCall::Validators { .. } => RpcOutput::Validators(decode_list(method, value)?),
            RpcCall::Delegations(_) => RpcOutput::Delegations(decode_list(method, value)?),
            RpcCall::Proposals { .. } => RpcOutput::Proposals(decode_list(method, value)?),
        })
    }
}

/// Build the request for a token-details lookup.
pub fn token_details(address: &Address) -> RpcRequest {
    RpcCall::TokenDetails(*address).to_request()
}

fn decode_quantity(method: &str, value: &Value) -> Result<BigUint, Error> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Decode(format!("{method}: expected hex quantity, got {value}")))?;
    if !raw.starts_with("0x") {
        return Err(Error::Decode(format!("{method}: quantity '{raw}' is not 0x-prefixed")));
    }
    let digits = &raw[2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Decode(format!("{method}: invalid quantity '{raw}'")));
    }
    Ok(numeric::parse_integer_amount(raw))
}

fn decode_u64_quantity(method: &str, value: &Value) -> Result<u64, Error> {
    let n = decode_quantity(method, value)?;
    u64::try_from(&n).map_err(|_| Error::Decode(format!("{method}: quantity {n} overflows u64")))
}

fn decode_optional<T: DeserializeOwned>(method: &str, value: Value) -> Result<Option<T>, Error> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| Error::Decode(format!("{method}: {e}")))
}

/// Lists may come back as `null` when empty.
fn decode_list<T: DeserializeOwned>(method: &str, value: Value) -> Result<Vec<T>, Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| Error::Decode(format!("{method}: {e}")))
}

impl<T: RpcTransport> BatchClient<T> {
    /// Issue one typed call as a single request.
    pub async fn call_typed(&self, call: &RpcCall) -> Result<RpcOutput, Error> {
        let value = self.call(call.method(), call.params()).await?;
        call.decode(value)
    }

    /// Issue typed calls as one batch, decoding each result.
    pub async fn batch_typed(&self, calls: &[RpcCall]) -> Result<Vec<RpcOutput>, Error> {
        let requests: Vec<RpcRequest> = calls.iter().map(RpcCall::to_request).collect();
        let values = self.batch(&requests).await?;
        calls
            .iter()
            .zip(values)
            .map(|(call, value)| call.decode(value))
            .collect()
    }

    pub async fn block_number(&self) -> Result<u64, Error> {
        match self.call_typed(&RpcCall::BlockNumber).await? {
            RpcOutput::BlockNumber(n) => Ok(n),
            other => Err(unexpected(BLOCK_NUMBER, &other)),
        }
    }

    pub async fn gas_price(&self) -> Result<BigUint, Error> {
        match self.call_typed(&RpcCall::GasPrice).await? {
            RpcOutput::GasPrice(n) => Ok(n),
            other => Err(unexpected(GAS_PRICE, &other)),
        }
    }
}

fn unexpected(method: &str, output: &RpcOutput) -> Error {
    Error::Decode(format!("{method}: unexpected output {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::rpc::transport::HandlerTransport;

    fn addr(n: u8) -> Address {
        format!("0x{:040x}", n).parse().unwrap()
    }

    #[test]
    fn test_params_shape() {
        let call = RpcCall::AccountTokenBalances {
            owner: addr(1),
            page: 1,
            size: 100,
        };
        assert_eq!(call.method(), ACCOUNT_TOKEN_BALANCES);
        assert_eq!(
            call.params(),
            vec![
                json!("0x0000000000000000000000000000000000000001"),
                json!("0x1"),
                json!("0x64")
            ]
        );
        assert!(RpcCall::BlockNumber.params().is_empty());
    }

    #[test]
    fn test_decode_quantities() {
        assert_eq!(
            RpcCall::BlockNumber.decode(json!("0x1b4")).unwrap(),
            RpcOutput::BlockNumber(436)
        );
        assert!(RpcCall::BlockNumber.decode(json!(436)).is_err());
        assert!(RpcCall::BlockNumber.decode(json!("436")).is_err());
        assert!(RpcCall::GasPrice.decode(json!("0x")).is_err());
        assert!(RpcCall::BlockNumber
            .decode(json!("0x1ffffffffffffffffff"))
            .is_err());
    }

    #[test]
    fn test_decode_token_details() {
        let call = RpcCall::TokenDetails(addr(2));
        assert_eq!(call.decode(Value::Null).unwrap(), RpcOutput::TokenDetails(None));

        let out = call
            .decode(json!({"address": format!("0x{:040x}", 2), "symbol": "HLS", "decimals": 18}))
            .unwrap();
        match out {
            RpcOutput::TokenDetails(Some(record)) => assert_eq!(record.symbol, "HLS"),
            other => panic!("unexpected {other:?}"),
        }

        // Shape drift is caught at the boundary.
        let err = call.decode(json!({"symbol": 5})).unwrap_err();
        assert!(matches!(err, Error::Decode(msg) if msg.starts_with(TOKEN_DETAILS)));
    }

    #[test]
    fn test_decode_lists_accept_null() {
        let call = RpcCall::Validators { page: 1, size: 10 };
        assert_eq!(call.decode(Value::Null).unwrap(), RpcOutput::Validators(vec![]));
        assert!(call.decode(json!({"not": "a list"})).is_err());
    }

    #[tokio::test]
    async fn test_batch_typed() {
        let client = BatchClient::new(HandlerTransport::new(|payload| {
            let requests = payload.as_array().cloned().unwrap_or_default();
            let responses: Vec<Value> = requests
                .iter()
                .map(|r| {
                    let result = match r["method"].as_str() {
                        Some(BLOCK_NUMBER) => json!("0x10"),
                        Some(GAS_PRICE) => json!("0x3b9aca00"),
                        _ => Value::Null,
                    };
                    json!({"jsonrpc": "2.0", "id": r["id"], "result": result})
                })
                .collect();
            Ok::<_, TransportError>(Value::Array(responses))
        }));

        let outputs = client
            .batch_typed(&[RpcCall::GasPrice, RpcCall::BlockNumber, RpcCall::Proposals { page: 1, size: 5 }])
            .await
            .unwrap();
        assert_eq!(outputs[0], RpcOutput::GasPrice(BigUint::from(1_000_000_000u64)));
        assert_eq!(outputs[1], RpcOutput::BlockNumber(16));
        assert_eq!(outputs[2], RpcOutput::Proposals(vec![]));
    }

    #[tokio::test]
    async fn test_block_number_helper() {
        let client = BatchClient::new(HandlerTransport::new(|payload| {
            Ok(json!({"jsonrpc": "2.0", "id": payload["id"], "result": "0xff"}))
        }));
        assert_eq!(client.block_number().await.unwrap(), 255);
    }
}
