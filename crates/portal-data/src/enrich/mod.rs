//! Joins on-chain records with off-chain price and display data.

pub mod display;
pub mod enricher;
pub mod price;
pub mod proposal;
pub mod token;
pub mod validator;

pub use enricher::TokenEnricher;
pub use price::{HttpPriceSource, PriceRow, PriceSource, StaticPriceSource};
pub use proposal::{enrich_proposals, EnrichedProposal, ProposalRecord, VoteOption};
pub use token::{EnrichedToken, TokenHolding, TokenLookupKey, TokenMetadataRecord};
pub use validator::{enrich_delegations, enrich_validators, EnrichedValidator, ValidatorRecord};
