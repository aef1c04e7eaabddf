pub mod registry;

pub use registry::{GroupId, InFlightGuard, UpstreamGroup, UpstreamInstance, UpstreamRegistry};
