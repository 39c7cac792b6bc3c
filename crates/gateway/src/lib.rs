pub mod nodes;
pub mod server;

pub use nodes::PassthroughExecutor;
pub use server::{create_server, AppState};
