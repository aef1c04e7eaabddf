pub mod router;

pub use router::{normalize_pattern, Route, RouteTable, RouteTableBuilder};
