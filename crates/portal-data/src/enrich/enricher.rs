use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use num_bigint::BigUint;
use parking_lot::Mutex;

use crate::address::Address;
use crate::enrich::display::token_display;
use crate::enrich::price::{PriceRow, PriceSource};
use crate::enrich::token::{
    EnrichedToken, TokenBalance, TokenFunctional, TokenHolding, TokenLookupKey,
    TokenMetadataRecord, TokenPrice,
};
use crate::numeric;
use crate::rpc::batch::BatchClient;
use crate::rpc::methods::{self, RpcCall, RpcOutput};
use crate::rpc::transport::RpcTransport;

type PendingRecord = Shared<oneshot::Receiver<Option<TokenMetadataRecord>>>;

/// Joins on-chain token metadata with price and balance data.
///
/// Lookups for the same token that overlap in time share one network
/// request. Fetched metadata is kept for the enricher's lifetime.
pub struct TokenEnricher<T, P> {
    batch: Arc<BatchClient<T>>,
    prices: P,
    chain_id: u64,
    chunk_size: usize,
    records: Mutex<HashMap<TokenLookupKey, TokenMetadataRecord>>,
    inflight: Mutex<HashMap<TokenLookupKey, PendingRecord>>,
}

/// Removes this caller's in-flight registrations if it is dropped before
/// publishing results, so later callers do not wait on a dead lookup.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<TokenLookupKey, PendingRecord>>,
    keys: Vec<TokenLookupKey>,
}

impl InflightGuard<'_> {
    fn disarm(mut self) {
        self.keys.clear();
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut inflight = self.inflight.lock();
        for key in &self.keys {
            inflight.remove(key);
        }
    }
}

impl<T: RpcTransport, P: PriceSource> TokenEnricher<T, P> {
    pub fn new(batch: Arc<BatchClient<T>>, prices: P, chain_id: u64, chunk_size: usize) -> Self {
        Self {
            batch,
            prices,
            chain_id,
            chunk_size: chunk_size.max(1),
            records: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Enrich tokens without balance information.
    pub async fn enrich(&self, addresses: &[Address]) -> HashMap<Address, EnrichedToken> {
        let holdings: Vec<TokenHolding> = addresses
            .iter()
            .map(|address| TokenHolding {
                address: *address,
                balance: BigUint::from(0u8),
            })
            .collect();
        self.enrich_holdings(&holdings).await
    }

    /// Enrich token balances. Tokens whose metadata cannot be resolved are
    /// absent from the result.
    pub async fn enrich_holdings(&self, holdings: &[TokenHolding]) -> HashMap<Address, EnrichedToken> {
        let mut balances: HashMap<Address, BigUint> = HashMap::with_capacity(holdings.len());
        let mut unique = Vec::with_capacity(holdings.len());
        for holding in holdings {
            if !balances.contains_key(&holding.address) {
                balances.insert(holding.address, holding.balance.clone());
                unique.push(holding.address);
            }
        }

        let records = self.metadata(&unique).await;
        if records.len() < unique.len() {
            tracing::debug!(
                requested = unique.len(),
                resolved = records.len(),
                "some tokens have no metadata"
            );
        }

        let symbols: Vec<String> = records
            .values()
            .map(|r| r.symbol.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let prices = if symbols.is_empty() {
            HashMap::new()
        } else {
            match self.prices.fetch_token_data(&symbols).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, symbols = symbols.len(), "price lookup failed, using zero prices");
                    HashMap::new()
                }
            }
        };

        records
            .into_iter()
            .map(|(address, record)| {
                let row = prices.get(&record.symbol.trim().to_lowercase());
                let balance = balances.remove(&address).unwrap_or_default();
                let enriched = build_enriched(self.chain_id, record, balance, row);
                (address, enriched)
            })
            .collect()
    }

    /// Resolve on-chain metadata, sharing lookups already in flight.
    pub async fn metadata(&self, addresses: &[Address]) -> HashMap<Address, TokenMetadataRecord> {
        let mut found = HashMap::with_capacity(addresses.len());
        let mut waiting: Vec<(Address, PendingRecord)> = Vec::new();
        let mut owned: Vec<(Address, TokenLookupKey, oneshot::Sender<Option<TokenMetadataRecord>>)> =
            Vec::new();
        let mut guard = InflightGuard {
            inflight: &self.inflight,
            keys: Vec::new(),
        };

        {
            let records = self.records.lock();
            let mut inflight = self.inflight.lock();
            for address in addresses {
                if found.contains_key(address) {
                    continue;
                }
                let key = TokenLookupKey::new(self.chain_id, address);
                if let Some(record) = records.get(&key) {
                    found.insert(*address, record.clone());
                } else if let Some(pending) = inflight.get(&key) {
                    if !waiting.iter().any(|(a, _)| a == address) {
                        waiting.push((*address, pending.clone()));
                    }
                } else {
                    let (tx, rx) = oneshot::channel();
                    inflight.insert(key.clone(), rx.shared());
                    guard.keys.push(key.clone());
                    owned.push((*address, key, tx));
                }
            }
        }

        if !owned.is_empty() {
            let to_fetch: Vec<Address> = owned.iter().map(|(a, _, _)| *a).collect();
            let fetched = self.fetch_records(&to_fetch).await;

            {
                let mut records = self.records.lock();
                let mut inflight = self.inflight.lock();
                for (address, key, tx) in owned {
                    let record = fetched.get(&address).cloned();
                    if let Some(ref record) = record {
                        records.insert(key.clone(), record.clone());
                    }
                    inflight.remove(&key);
                    // Waiters may have gone away; nothing to do then.
                    let _ = tx.send(record);
                }
            }
            guard.disarm();
            found.extend(fetched);
        } else {
            guard.disarm();
        }

        for (address, pending) in waiting {
            if let Ok(Some(record)) = pending.await {
                found.insert(address, record);
            }
        }

        found
    }

    /// Drop memoised metadata.
    pub fn clear_cache(&self) {
        self.records.lock().clear();
    }

    async fn fetch_records(&self, addresses: &[Address]) -> HashMap<Address, TokenMetadataRecord> {
        let raw = self
            .batch
            .batch_chunked(addresses, self.chunk_size, methods::token_details)
            .await;

        raw.into_iter()
            .filter_map(|(address, value)| {
                match RpcCall::TokenDetails(address).decode(value) {
                    Ok(RpcOutput::TokenDetails(Some(record))) => Some((address, record)),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(token = %address, error = %e, "discarding malformed token details");
                        None
                    }
                }
            })
            .collect()
    }
}

fn build_enriched(
    chain_id: u64,
    record: TokenMetadataRecord,
    raw_balance: BigUint,
    price: Option<&PriceRow>,
) -> EnrichedToken {
    let unit_price = price
        .map(|p| p.price)
        .filter(|p| p.is_finite() && *p >= 0.0)
        .unwrap_or(0.0);
    let amount = numeric::to_decimal(&raw_balance, record.decimals);

    EnrichedToken {
        display: token_display(&record, price),
        price: TokenPrice { usd: unit_price },
        balance: TokenBalance {
            raw: raw_balance,
            amount,
            total_price: numeric::total_price(amount, unit_price),
        },
        functional: TokenFunctional {
            address: record.address,
            chain_id,
            denom: record.denom.clone(),
            decimals: record.decimals,
        },
        origin_blockchain: record.origin_blockchain.clone(),
        record,
    }
}
