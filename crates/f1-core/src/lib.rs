//! f1-core: pure domain logic for the live-timing relay.
//!
//! This crate holds everything that transforms or accumulates feed data
//! without performing I/O: the normalizer that turns raw upstream frames
//! into canonical events, the driver-state accumulator, and the shared
//! fixed-window rate limiter.  The relay service wires these into its
//! network loops.

pub mod drivers;
pub mod event;
pub mod normalize;
pub mod rate_limit;

pub use drivers::{DriverRecord, DriverTable};
pub use event::{CanonicalEvent, EventBody};
pub use normalize::Normalizer;
pub use rate_limit::{RateLimiter, RateStatus};
