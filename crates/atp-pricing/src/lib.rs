//! Pricing core for the ATP router.
//!
//! Tracks per-(provider, model) token pricing with a TTL cache, detects
//! price changes of at least 1% and keeps a bounded change history, and
//! computes expected request costs for the admission pipeline's cost
//! pre-check. The [`PricingManager`] composes the cache with per-provider
//! [`PricingFetcher`]s and best-effort [`PricingAlertSink`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use atp_pricing::{ModelPricing, PricingCache};
//!
//! let cache = PricingCache::with_ttl_seconds(1800);
//! cache.set("vertex", "gemini-fast", ModelPricing::per_1k(0.5, 1.5), None);
//! let cost = cache.get("vertex", "gemini-fast").unwrap().calculate_cost(1000, 500);
//! ```

mod cache;
mod error;
mod manager;

pub use cache::{ModelPricing, PricingCache, PricingChange, PricingHistoryEntry};
pub use error::{PricingError, Result};
pub use manager::{
    CostOptimization, CostValidation, PricingAlertSink, PricingFetcher, PricingHealth,
    PricingManager, PricingTrend, RefreshReport, TrendDirection,
};
