//! # Canonical JSON
//!
//! The single serialization rule used for every hash pre-image in Strata:
//! marshal to a generic JSON value, order object keys lexicographically,
//! re-marshal compactly with no HTML escaping and no trailing newline.
//!
//! Digests must be reproducible across implementations, so this routine
//! exists exactly once. Block hashing, leaf hashing, and anchor signing
//! all call through here; if a second canonicalization site ever appears,
//! cross-chain verification is one refactor away from silently breaking.
//!
//! The key-ordering guarantee comes from `serde_json::Map` being backed by
//! a `BTreeMap` in its default configuration. Enabling serde_json's
//! `preserve_order` feature anywhere in the dependency graph would change
//! every digest on the network.

use serde::Serialize;

use super::CryptoError;

/// Serialize `value` into its canonical JSON byte form.
///
/// Round-trips the value through `serde_json::Value` so that struct field
/// order (declaration order) is replaced by lexicographic key order at
/// every nesting level, then encodes compactly. serde_json never escapes
/// HTML characters and `to_vec` emits no trailing newline, so the
/// remaining rules hold by construction.
///
/// # Errors
///
/// Fails only when the value cannot be represented as JSON (e.g. a map
/// with non-string keys).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let generic = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&generic)?)
}
