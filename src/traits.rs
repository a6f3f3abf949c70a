use async_trait::async_trait;

use crate::error::{ApplyError, RaftError, RpcError};
use crate::message::{AppendEntries, AppendEntriesAck, GrantVote, RequestVote};
use crate::{LogIndex, NodeId};

// 结果类型别名
pub type RaftResult<T> = Result<T, RaftError>;
pub type RpcResult<T> = Result<T, RpcError>;
pub type ApplyResult<T> = Result<T, ApplyError>;

/// 节点间传输层。
///
/// 实现者负责把报文送达目标节点。协议核心只做 fire-and-forget
/// 发送，不假设送达顺序或可靠性：丢失、重复、乱序都由每条入站
/// 报文上的任期/索引检查自行吸收。
#[async_trait]
pub trait Transport<C>: Send + Sync {
    async fn send_request_vote_request(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: RequestVote,
    ) -> RpcResult<()>;

    async fn send_request_vote_response(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: GrantVote,
    ) -> RpcResult<()>;

    async fn send_append_entries_request(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: AppendEntries<C>,
    ) -> RpcResult<()>;

    async fn send_append_entries_response(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: AppendEntriesAck,
    ) -> RpcResult<()>;
}

/// 已提交日志的消费方。
///
/// apply 按索引严格递增地被调用，每个已提交条目恰好一次
/// （应用失败的条目会在下次提交推进时重试）。
#[async_trait]
pub trait StateMachine<C>: Send + Sync {
    async fn apply(&self, index: LogIndex, command: &C) -> ApplyResult<()>;
}
