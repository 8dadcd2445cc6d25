//! Shape Store and Layer Order Allocator.
//!
//! The store keeps two tiers: server-confirmed records with per-field
//! timestamps, and the view the UI renders (confirmed state with pending
//! local operations replayed on top).

pub mod layer_order;
pub mod store;

pub use layer_order::{LayerOrderAllocator, LayerOrderError, Placement, Reorder};
pub use store::{ShapeOp, ShapeStore, StoreError};
