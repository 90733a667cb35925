//! The portal's data services, wired together from one config.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_bigint::BigUint;
use parking_lot::Mutex;

use crate::address::Address;
use crate::config::PortalConfig;
use crate::enrich::enricher::TokenEnricher;
use crate::enrich::price::{HttpPriceSource, PriceSource};
use crate::enrich::proposal::{enrich_proposals, EnrichedProposal, ProposalRecord, VoteOption};
use crate::enrich::token::{EnrichedToken, TokenHolding};
use crate::enrich::validator::{
    enrich_delegations, enrich_validators, EnrichedDelegation, EnrichedValidator, ValidatorRecord,
};
use crate::error::Error;
use crate::query::{QueryClient, QueryKey, QueryOptions, QueryResult, RateLimited, RateLimiter, RetryPolicy};
use crate::rpc::batch::BatchClient;
use crate::rpc::methods::{RpcCall, RpcOutput};
use crate::rpc::transport::{HttpTransport, RpcTransport};
use crate::storage::{
    now_millis, FileStorage, MemoryStorage, RecentEtfs, TieredStorage, VotingHistory,
};

/// Decimals of the chain's native staking token.
pub const NATIVE_DECIMALS: u8 = 18;

const PORTFOLIO_PAGE_SIZE: u64 = 100;
const PORTFOLIO_MAX_PAGES: u64 = 20;
const VALIDATOR_PAGE_SIZE: u64 = 100;

pub const PORTFOLIO_QUERY: &str = "portfolio";
pub const TOKENS_QUERY: &str = "tokens";
pub const VALIDATORS_QUERY: &str = "validators";
pub const DELEGATIONS_QUERY: &str = "delegations";
pub const PROPOSALS_QUERY: &str = "proposals";
pub const BLOCK_NUMBER_QUERY: &str = "blockNumber";
pub const GAS_PRICE_QUERY: &str = "gasPrice";

#[derive(Default)]
struct ServerVotes {
    votes: HashMap<u64, VoteOption>,
    synced_at: Option<i64>,
}

/// Owns every data service the portal needs.
///
/// Construct one per process with [`Portal::new`], or from explicit parts in
/// tests with [`Portal::from_parts`]. The node transport and the price
/// source share one [`RateLimiter`]; every outbound request takes a token.
pub struct Portal<T, P> {
    config: PortalConfig,
    limiter: RateLimiter,
    batch: Arc<BatchClient<RateLimited<T>>>,
    enricher: Arc<TokenEnricher<RateLimited<T>, RateLimited<P>>>,
    query: QueryClient,
    storage: Arc<TieredStorage>,
    votes: VotingHistory,
    etfs: RecentEtfs,
    server_votes: Mutex<ServerVotes>,
    auth_failed: Arc<AtomicBool>,
    watched: Mutex<Option<Address>>,
}

impl Portal<HttpTransport, HttpPriceSource> {
    /// Build the HTTP-backed portal described by `config`.
    pub fn new(config: PortalConfig) -> Result<Self, Error> {
        config.validate()?;
        let transport = HttpTransport::new(config.rpc_url.clone(), config.http_timeout())?;
        let prices = HttpPriceSource::new(config.price_api_url.clone(), config.http_timeout())?;

        let storage = match &config.persistence.storage_dir {
            Some(dir) => {
                let persistent = FileStorage::open(dir)
                    .map_err(|e| Error::Config(format!("cannot open storage {}: {e}", dir.display())))?;
                TieredStorage::new(Arc::new(persistent), Arc::new(MemoryStorage::new()))
            }
            None => TieredStorage::in_memory(),
        };

        Ok(Self::from_parts(config, transport, prices, Arc::new(storage)))
    }
}

impl<T, P> Portal<T, P>
where
    T: RpcTransport + 'static,
    P: PriceSource + 'static,
{
    pub fn from_parts(config: PortalConfig, transport: T, prices: P, storage: Arc<TieredStorage>) -> Self {
        let limiter = RateLimiter::from_config(&config.rate_limit);
        let batch = Arc::new(BatchClient::new(RateLimited::new(transport, limiter.clone())));
        let enricher = Arc::new(TokenEnricher::new(
            batch.clone(),
            RateLimited::new(prices, limiter.clone()),
            config.chain_id,
            config.chunk_size,
        ));
        let query = QueryClient::new(RetryPolicy::from_config(&config.retry));

        let auth_failed = Arc::new(AtomicBool::new(false));
        let flag = auth_failed.clone();
        query.set_error_observer(move |key, err| {
            if err.http_status() == Some(401) && !flag.swap(true, Ordering::SeqCst) {
                tracing::warn!(key = %key, "authentication rejected by the node");
            }
        });

        let votes = VotingHistory::load(storage.clone(), config.persistence.max_votes);
        let etfs = RecentEtfs::load(storage.clone(), config.persistence.max_recent_etfs);

        Self {
            config,
            limiter,
            batch,
            enricher,
            query,
            storage,
            votes,
            etfs,
            server_votes: Mutex::new(ServerVotes::default()),
            auth_failed,
            watched: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn batch(&self) -> &BatchClient<RateLimited<T>> {
        &self.batch
    }

    pub fn enricher(&self) -> &TokenEnricher<RateLimited<T>, RateLimited<P>> {
        &self.enricher
    }

    /// The bucket shared by every outbound request.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn query_client(&self) -> &QueryClient {
        &self.query
    }

    pub fn storage(&self) -> &TieredStorage {
        &self.storage
    }

    pub fn voting_history(&self) -> &VotingHistory {
        &self.votes
    }

    pub fn recent_etfs(&self) -> &RecentEtfs {
        &self.etfs
    }

    fn options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.config.cache)
    }

    /// Token balances of `owner`, enriched and sorted by USD value.
    pub async fn portfolio(&self, owner: Address) -> Result<Vec<EnrichedToken>, Error> {
        let key = QueryKey::new(PORTFOLIO_QUERY).scoped(&owner);
        let batch = self.batch.clone();
        let enricher = self.enricher.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                let enricher = enricher.clone();
                async move { fetch_portfolio(&batch, &enricher, owner).await }
            })
            .await;
        settle(&key, result)
    }

    /// Enrich arbitrary tokens without balances. Tokens whose metadata could
    /// not be fetched are absent from the map.
    pub async fn tokens(&self, addresses: &[Address]) -> Result<HashMap<Address, EnrichedToken>, Error> {
        let mut wanted: Vec<String> = addresses.iter().map(Address::to_lower_hex).collect();
        wanted.sort();
        wanted.dedup();
        let key = QueryKey::new(TOKENS_QUERY).param(wanted.join(","));

        let enricher = self.enricher.clone();
        let addresses = addresses.to_vec();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let enricher = enricher.clone();
                let addresses = addresses.clone();
                async move { Ok(enricher.enrich(&addresses).await) }
            })
            .await;
        settle(&key, result)
    }

    pub async fn validators(&self) -> Result<Vec<EnrichedValidator>, Error> {
        let key = QueryKey::new(VALIDATORS_QUERY).param(VALIDATOR_PAGE_SIZE);
        let batch = self.batch.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                async move {
                    let records = fetch_validators(&batch).await?;
                    Ok(enrich_validators(records, NATIVE_DECIMALS))
                }
            })
            .await;
        settle(&key, result)
    }

    /// Delegations of `owner`, joined with validator names. Both lists come
    /// back in one batch.
    pub async fn delegations(&self, owner: Address) -> Result<Vec<EnrichedDelegation>, Error> {
        let key = QueryKey::new(DELEGATIONS_QUERY).scoped(&owner);
        let batch = self.batch.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                async move {
                    let calls = [
                        RpcCall::Delegations(owner),
                        RpcCall::Validators {
                            page: 1,
                            size: VALIDATOR_PAGE_SIZE,
                        },
                    ];
                    let mut outputs = batch.batch_typed(&calls).await?.into_iter();
                    match (outputs.next(), outputs.next()) {
                        (Some(RpcOutput::Delegations(delegations)), Some(RpcOutput::Validators(validators))) => {
                            Ok(enrich_delegations(delegations, &validators, NATIVE_DECIMALS))
                        }
                        _ => Err(Error::Decode("delegations: unexpected batch outputs".to_string())),
                    }
                }
            })
            .await;
        settle(&key, result)
    }

    /// Proposals with tallies and the user's vote overlaid.
    ///
    /// Proposal records are cached; the vote overlay is recomputed on every
    /// call so a freshly cast vote shows up immediately.
    pub async fn proposals(&self, page: u64, size: u64) -> Result<Vec<EnrichedProposal>, Error> {
        let key = QueryKey::new(PROPOSALS_QUERY).param(page).param(size);
        let batch = self.batch.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                async move {
                    match batch.call_typed(&RpcCall::Proposals { page, size }).await? {
                        RpcOutput::Proposals(records) => Ok(records),
                        _ => Err(Error::Decode("proposals: unexpected output".to_string())),
                    }
                }
            })
            .await;
        let records: Vec<ProposalRecord> = settle(&key, result)?;

        let local = self.votes.votes();
        let server = self.server_votes.lock();
        Ok(enrich_proposals(records, &server.votes, &local, server.synced_at))
    }

    /// Replace the server's view of the user's votes.
    pub fn sync_server_votes(&self, votes: HashMap<u64, VoteOption>) {
        let mut server = self.server_votes.lock();
        server.votes = votes;
        server.synced_at = Some(now_millis());
    }

    pub async fn block_number(&self) -> Result<u64, Error> {
        let key = QueryKey::new(BLOCK_NUMBER_QUERY);
        let batch = self.batch.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                async move { batch.block_number().await }
            })
            .await;
        settle(&key, result)
    }

    pub async fn gas_price(&self) -> Result<BigUint, Error> {
        let key = QueryKey::new(GAS_PRICE_QUERY);
        let batch = self.batch.clone();
        let result = self
            .query
            .query(key.clone(), self.options(), move || {
                let batch = batch.clone();
                async move { batch.gas_price().await }
            })
            .await;
        settle(&key, result)
    }

    /// Switch the connected wallet. Everything cached for the previous
    /// address is dropped before the switch becomes visible.
    pub fn watch_address(&self, address: Option<Address>) -> Option<Address> {
        let mut watched = self.watched.lock();
        if let Some(previous) = *watched {
            if Some(previous) != address {
                self.query.invalidate_scope(&previous);
            }
        }
        tracing::debug!(address = ?address, "watched address changed");
        std::mem::replace(&mut *watched, address)
    }

    pub fn watched_address(&self) -> Option<Address> {
        *self.watched.lock()
    }

    /// Whether a request was rejected with HTTP 401 since the last reset.
    pub fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    pub fn reset_auth_failure(&self) {
        self.auth_failed.store(false, Ordering::SeqCst);
    }
}

fn settle<V>(key: &QueryKey, result: QueryResult<V>) -> Result<V, Error> {
    result
        .into_result()?
        .ok_or_else(|| Error::Config(format!("query {key} is disabled")))
}

async fn fetch_portfolio<T, P>(
    batch: &BatchClient<RateLimited<T>>,
    enricher: &TokenEnricher<RateLimited<T>, RateLimited<P>>,
    owner: Address,
) -> Result<Vec<EnrichedToken>, Error>
where
    T: RpcTransport,
    P: PriceSource,
{
    let mut holdings: Vec<TokenHolding> = Vec::new();
    for page in 1..=PORTFOLIO_MAX_PAGES {
        let call = RpcCall::AccountTokenBalances {
            owner,
            page,
            size: PORTFOLIO_PAGE_SIZE,
        };
        let RpcOutput::AccountTokenBalances(chunk) = batch.call_typed(&call).await? else {
            return Err(Error::Decode("account balances: unexpected output".to_string()));
        };
        let last_page = (chunk.len() as u64) < PORTFOLIO_PAGE_SIZE;
        holdings.extend(chunk);
        if last_page {
            break;
        }
    }

    let mut tokens: Vec<EnrichedToken> = enricher
        .enrich_holdings(&holdings)
        .await
        .into_values()
        .collect();
    tokens.sort_by(|a, b| {
        b.balance
            .total_price
            .total_cmp(&a.balance.total_price)
            .then_with(|| a.display.symbol.cmp(&b.display.symbol))
    });
    Ok(tokens)
}

async fn fetch_validators<T: RpcTransport>(batch: &BatchClient<RateLimited<T>>) -> Result<Vec<ValidatorRecord>, Error> {
    let call = RpcCall::Validators {
        page: 1,
        size: VALIDATOR_PAGE_SIZE,
    };
    match batch.call_typed(&call).await? {
        RpcOutput::Validators(records) => Ok(records),
        _ => Err(Error::Decode("validators: unexpected output".to_string())),
    }
}
