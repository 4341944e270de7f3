pub mod claude;
pub mod protocol;

pub use claude::{
    AgentExecutor, ExecutorConfig, ExecutorError, SessionInput, SessionMode, SharedChild,
    SpawnedSession,
};
pub use protocol::{SessionEvent, SessionResult, StreamParser};
