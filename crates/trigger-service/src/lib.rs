pub mod manager;
pub mod resources;
pub mod result_cache;

pub use manager::{
    TriggerManager, TriggerOptions, TriggerRequest, TriggerResponse, TriggerStats, TriggerStatus,
    WaitResponse,
};
pub use resources::ResourceManager;
pub use result_cache::{MokaResultCache, RedisResultCache};
