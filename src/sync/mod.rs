//! Client-side cache synchronization.
//!
//! Paginated lists are merged per filter fingerprint, quantity edits are
//! applied optimistically and written back debounced, and the cart is
//! validated against server stock before an order is placed.

mod coalescer;
mod error;
mod facade;
mod key;
mod merger;
mod reconcile;
mod state;

pub use coalescer::{DebounceWindows, EntitySnapshot, Surface};
pub use error::SyncError;
pub use facade::{SyncFacade, ORDERS, PRODUCTS};
pub use key::CacheKey;
pub use merger::ListSnapshot;
