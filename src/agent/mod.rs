pub mod protocol;
pub mod runner;

pub use protocol::{AgentInput, AgentOutput, AgentStatus, OUTPUT_END_MARKER, OUTPUT_START_MARKER};
pub use runner::{AgentRunResult, AgentRunner, AgentSpawnSpec};
