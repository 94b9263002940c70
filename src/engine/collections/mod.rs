//! Thin wrappers around the standard collections, parameterized over
//! the hasher chosen at compile time via feature flags.

#[cfg(feature = "collections_randomstate_twox_hash")]
mod hasher {
    pub type RandomState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;
}

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
mod hasher {
    pub type RandomState = std::collections::hash_map::RandomState;
}

/// A `HashMap` using this crate's chosen default hasher.
pub type HashMap<K, V> = std::collections::HashMap<K, V, hasher::RandomState>;

/// A `HashSet` using this crate's chosen default hasher.
pub type HashSet<K> = std::collections::HashSet<K, hasher::RandomState>;

/// Creates a new, empty `HashMap` with this crate's default hasher.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new, empty `HashSet` with this crate's default hasher.
pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}
