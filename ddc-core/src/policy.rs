//! Cache policy flags for structured requests.

use bitflags::bitflags;

use crate::enums::Locality;

bitflags! {
    /// Which tiers a structured request may query and store to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CachePolicy: u32 {
        const NONE = 0;
        const QUERY_LOCAL = 1 << 0;
        const QUERY_REMOTE = 1 << 1;
        const STORE_LOCAL = 1 << 2;
        const STORE_REMOTE = 1 << 3;

        const QUERY = Self::QUERY_LOCAL.bits() | Self::QUERY_REMOTE.bits();
        const STORE = Self::STORE_LOCAL.bits() | Self::STORE_REMOTE.bits();
        const LOCAL = Self::QUERY_LOCAL.bits() | Self::STORE_LOCAL.bits();
        const REMOTE = Self::QUERY_REMOTE.bits() | Self::STORE_REMOTE.bits();
        const DEFAULT = Self::QUERY.bits() | Self::STORE.bits();
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl CachePolicy {
    /// May a backend with this locality be queried?
    ///
    /// A mixed backend is queried if either side is allowed; it applies the
    /// policy to its own tiers.
    pub fn allows_query(self, locality: Locality) -> bool {
        match locality {
            Locality::Local => self.contains(Self::QUERY_LOCAL),
            Locality::Remote => self.contains(Self::QUERY_REMOTE),
            Locality::Mixed => self.intersects(Self::QUERY),
        }
    }

    /// May a backend with this locality be stored to?
    pub fn allows_store(self, locality: Locality) -> bool {
        match locality {
            Locality::Local => self.contains(Self::STORE_LOCAL),
            Locality::Remote => self.contains(Self::STORE_REMOTE),
            Locality::Mixed => self.intersects(Self::STORE),
        }
    }
}
