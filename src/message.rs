use serde::{Deserialize, Serialize};

use crate::{LogIndex, NodeId, Term};

// === 消息定义（节点间交换的不可变值类型）===

/// 复制日志条目。索引由日志中的位置隐含，不单独存储。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub command: C,
}

impl<C> LogEntry<C> {
    pub fn new(term: Term, command: C) -> Self {
        Self { term, command }
    }
}

/// 候选人拉票请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_term: Term,
    pub last_log_index: LogIndex,
}

/// 投票答复
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantVote {
    pub granted: bool,
    pub voter_id: NodeId,
    pub term: Term,
}

/// 日志复制请求（entries 为空即心跳）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries<C> {
    pub leader_term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<C>>,
}

/// 日志复制确认。不携带索引，Leader 依照自己记录的
/// 最近下发批次解释每个 peer 的确认。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesAck {
    pub follower_id: NodeId,
    pub term: Term,
    pub success: bool,
}

/// 传输层信封：四种报文的统一载体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<C> {
    RequestVote(RequestVote),
    GrantVote(GrantVote),
    AppendEntries(AppendEntries<C>),
    AppendEntriesAck(AppendEntriesAck),
}
