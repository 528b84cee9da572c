//! Sliding Window Rate Limiter
//!
//! Distributed admission control for HTTP routes. Each (client, route) pair
//! owns a sliding window of request timestamps held in Redis, so every
//! process sharing the store enforces the same limit.

pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use crate::config::{RateLimitPolicy, Settings};
pub use crate::error::{RateLimitError, Result};
pub use crate::http::wrap;
pub use crate::limiter::{RateLimitResult, RateLimiter, WindowStatus};
pub use crate::service::RateLimitService;
pub use crate::store::{MemoryStore, RateLimitStore};
pub use crate::utils::RouteName;
