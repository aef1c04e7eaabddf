pub mod body;
pub mod http;

pub use body::{RelayBody, RelayError};
pub use http::{classify_error, strip_hop_by_hop, HttpProxy};
