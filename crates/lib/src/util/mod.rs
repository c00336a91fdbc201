//! Shared utilities.
//!
//! Digests, fingerprints and directory hashing used across the crate.

pub mod hash;
