//! Core state engine: KV store, service registry, change bus, ACL engine,
//! rate limiter, and persistence mirror behind a single coordinator.

pub mod acl;
pub mod bus;
pub mod coordinator;
pub mod event;
pub mod index;
pub mod kv;
pub mod pattern;
pub mod persistence;
pub mod ratelimit;
pub mod registry;

pub use acl::{AclEngine, Capability, Policy, ResourceDomain, Rule as AclRule};
pub use bus::{ChangeBus, WatcherId, WatcherStats};
pub use coordinator::Coordinator;
pub use event::ChangeEvent;
pub use index::IndexAllocator;
pub use kv::{BatchSetItem, KvEntry, KvStore};
pub use persistence::Mirror;
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use registry::{ServiceEntry, ServiceRegistration, ServiceRegistry};
