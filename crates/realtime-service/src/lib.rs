pub mod fabric;
pub mod websocket;

pub use fabric::EventFabric;
pub use websocket::{handle_socket, WsQuery};
