//! Provider registry: holds the set of configured providers ordered by
//! priority, and the operations (add/remove/filter/whitelist/share
//! credentials) the gateway and CLI use to shape that set (spec §4.3).

pub mod registry;

pub use registry::ProviderRegistry;
