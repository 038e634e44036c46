//! The caching lock service.
//!
//! [`protocol`] defines the wire types, [`authority`] the server side
//! that owns lock state and drives revoke/retry callbacks, and [`cache`]
//! the client side that keeps granted locks local until revoked.

pub mod authority;
pub mod cache;
pub mod protocol;

pub use authority::{AuthorityStatsSnapshot, LockAuthority};
pub use cache::{CacheStatsSnapshot, LockCache};
