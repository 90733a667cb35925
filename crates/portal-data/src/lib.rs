//! Data core for a staking, governance and portfolio portal.
//!
//! Batches JSON-RPC reads, joins on-chain token, validator and proposal
//! records with off-chain prices, caches the results behind a rate limiter
//! and keeps the user's local votes and recent ETFs.

pub mod address;
pub mod config;
pub mod enrich;
pub mod error;
pub mod numeric;
pub mod portal;
pub mod query;
pub mod rpc;
pub mod storage;

// Re-exports for convenience
pub use address::Address;
pub use config::PortalConfig;
pub use enrich::{EnrichedProposal, EnrichedToken, EnrichedValidator, TokenEnricher};
pub use error::Error;
pub use portal::Portal;
pub use query::{QueryClient, QueryKey, QueryOptions, RateLimited, RateLimiter};
pub use rpc::{BatchClient, HttpTransport, RpcRequest, RpcTransport};
