//! Durable chain storage. See [`store::ChainStore`].

pub mod store;

pub use store::{AnchorInfo, ChainStore, StoreError};
