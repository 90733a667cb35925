use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::enrich::display::TokenDisplay;
use crate::numeric::amount_serde;

/// Normalized token lookup key (CAIP-19 style: `eip155:{chain_id}/erc20:{address}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenLookupKey(pub String);

impl TokenLookupKey {
    /// Create a lookup key from chain ID and address.
    pub fn new(chain_id: u64, address: &Address) -> Self {
        Self(format!("eip155:{chain_id}/erc20:{}", address.to_lower_hex()))
    }
}

/// Contract address of the same token on another chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContract {
    pub chain_id: u64,
    /// Kept as a string: not every chain uses 20-byte addresses.
    pub address: String,
}

/// Token metadata as reported by the node. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadataRecord {
    pub address: Address,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub decimals: u8,
    /// Base denomination on the native chain.
    #[serde(default)]
    pub denom: String,
    #[serde(default, with = "amount_serde")]
    pub total_supply: BigUint,
    #[serde(default)]
    pub holders_count: u64,
    #[serde(default)]
    pub contract_addresses: Vec<ChainContract>,
    /// Chain id (as reported) the token was first minted on.
    #[serde(default)]
    pub origin_blockchain: String,
}

impl TokenMetadataRecord {
    /// Whether the token originates on `chain_id` rather than being bridged in.
    pub fn is_origin_chain(&self, chain_id: u64) -> bool {
        self.origin_blockchain.is_empty() || self.origin_blockchain == chain_id.to_string()
    }

    /// Contract address of this token on another chain.
    pub fn address_on(&self, chain_id: u64) -> Option<&str> {
        self.contract_addresses
            .iter()
            .find(|c| c.chain_id == chain_id)
            .map(|c| c.address.as_str())
    }
}

/// A raw token balance held by an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenHolding {
    pub address: Address,
    #[serde(default, with = "amount_serde")]
    pub balance: BigUint,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TokenPrice {
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    #[serde(with = "amount_serde")]
    pub raw: BigUint,
    /// `raw / 10^decimals`.
    pub amount: f64,
    /// `amount × price.usd`.
    pub total_price: f64,
}

/// Fields needed to build transactions against the token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenFunctional {
    pub address: Address,
    pub chain_id: u64,
    pub denom: String,
    pub decimals: u8,
}

/// On-chain metadata joined with display, price and balance data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedToken {
    pub record: TokenMetadataRecord,
    pub display: TokenDisplay,
    pub price: TokenPrice,
    pub balance: TokenBalance,
    pub functional: TokenFunctional,
    pub origin_blockchain: String,
}
