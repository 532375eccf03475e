//! Map and set aliases used across the engine.
//!
//! With the default `gxhash` feature these are backed by gxhash, which needs
//! AES-NI/SSE2 (or NEON) at runtime. Building with `--no-default-features`
//! falls back to the std collections and `RandomState`, keeping the same
//! `new()`/`with_capacity()` constructors through the `*Ext` traits.

use crate::digest::Digest;

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher, HashMapExt, HashSetExt};

#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = gxhash::HashMap<K, V>;

#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = std::collections::HashMap<K, V>;

#[cfg(feature = "gxhash")]
pub type HashSet<T> = gxhash::HashSet<T>;

#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = std::collections::HashSet<T>;

#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;

/// Set of digests, used for store inventories
pub type DigestSet = HashSet<Digest>;

/// Concurrent digest set shared by parallel workers
pub type SharedDigestSet = dashmap::DashSet<Digest, GxBuildHasher>;

/// `new()` / `with_capacity()` for std maps when gxhash is disabled
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    fn new() -> Self;
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for std::collections::HashMap<K, V> {
    fn new() -> Self {
        std::collections::HashMap::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        std::collections::HashMap::with_capacity(capacity)
    }
}

/// `new()` / `with_capacity()` for std sets when gxhash is disabled
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    fn new() -> Self;
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for std::collections::HashSet<T> {
    fn new() -> Self {
        std::collections::HashSet::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        std::collections::HashSet::with_capacity(capacity)
    }
}

/// Build a [`SharedDigestSet`] with the configured hasher
pub fn shared_digest_set() -> SharedDigestSet {
    dashmap::DashSet::with_hasher(GxBuildHasher::default())
}
