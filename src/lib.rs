pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod mock_network;
pub mod node;
pub mod state;
pub mod timer;
pub mod traits;

// 类型定义

pub type NodeId = String;
pub type Term = u64;
/// 日志索引（0 起始，-1 为空日志哨兵）
pub type LogIndex = i64;

pub use error::{ApplyError, RaftError, RpcError};
pub use event::Event;
pub use log::ReplicatedLog;
pub use message::{AppendEntries, AppendEntriesAck, GrantVote, LogEntry, Message, RequestVote};
pub use node::{NodeSettings, RaftNode};
pub use state::Role;
pub use traits::{ApplyResult, RaftResult, RpcResult, StateMachine, Transport};
