pub mod config;
pub mod error;
pub mod events;
pub mod results;
pub mod types;

pub use error::{PlatformError, Result};
pub use events::{EventKind, EventPublisher, ExecutionEvent};
pub use results::ResultCache;
