pub mod dispatcher;
pub mod server;

pub use dispatcher::Dispatcher;
pub use server::{Gateway, GatewayServer, GatewaySettings, GatewayState};
