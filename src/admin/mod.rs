// Operator status, gateway health and metrics endpoints
pub mod status;

pub use status::{upstream_status, GroupStatus, InstanceStatus, StatusAdminRouter};
