pub mod balancer;

pub use balancer::{LeastInFlightBalancer, LoadBalancer, LoadBalancerStats};
