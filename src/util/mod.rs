pub mod lru_ttl;
pub mod throttle;

pub use lru_ttl::LruTtlCache;
pub use throttle::Throttle;
