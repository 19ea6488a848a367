//! Load balancing over healthy registry candidates.

mod select;

pub use select::{BalancerStats, ConnectionGuard, LoadBalancer, SelectionPolicy};
