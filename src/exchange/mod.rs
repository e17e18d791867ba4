// =============================================================================
// Exchange Module
// =============================================================================
//
// `client` is the perpetual-futures REST client. `rate_limit` tracks the
// venue's request-weight/order-count quotas from its response headers.

pub mod client;
pub mod rate_limit;

pub use client::{AiLogEntry, AssetBalance, ExchangeClient, FundingRate, PositionSnapshot, TickerSnapshot, UploadAck};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
