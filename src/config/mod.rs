pub mod schema;

pub use schema::{
    AgentConfig, ChannelsConfig, Config, EventsConfig, IpcConfig, PluginsConfig, SchedulerConfig,
};
