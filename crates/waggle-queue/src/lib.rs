mod queue;
mod store;

pub use queue::{
    LaneCounts, MessagePriority, MessageQueue, QueueConfig, QueueStats, QueuedMessage,
    DEFAULT_PRIORITIES,
};
pub use store::{ListStore, MemoryListStore, RedisListStore};
