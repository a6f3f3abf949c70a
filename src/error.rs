use thiserror::Error;
use tracing::{error, info, warn};

use crate::{LogIndex, NodeId};

/// 顶层Raft错误类型
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node already shut down")]
    Stopped,

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
}

/// RPC通信相关错误
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 状态机应用相关错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Command at index {0} already applied")]
    AlreadyApplied(LogIndex),

    #[error("State machine busy")]
    Busy,

    #[error("State machine error: {0}")]
    Internal(String),
}

// === 统一错误处理机制 ===

/// 回调错误的严重级别。过期任期、日志不匹配之类的协议内拒绝
/// 不走这里——它们是正常控制流，不是错误。
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// 协议无法自行恢复，需要人工介入
    Fatal,
    /// 下一个心跳/超时周期可自行恢复
    Recoverable,
    /// 仅需记录日志
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::NodeNotFound(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Timeout => ErrorSeverity::Recoverable,
            RpcError::Serialization(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ApplyError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ApplyError::AlreadyApplied(_) => ErrorSeverity::Ignorable,
            ApplyError::Busy => ErrorSeverity::Recoverable,
            ApplyError::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// 回调错误的统一处理：按严重级别记录。发送是 fire-and-forget，
/// 失败从不向协议核心传播——丢失的报文由下个心跳/超时周期弥补。
pub(crate) struct CallbackErrorHandler {
    node_id: NodeId,
}

impl CallbackErrorHandler {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    pub fn handle<T, E: ErrorHandler>(
        &self,
        result: Result<T, E>,
        operation: &str,
        target: Option<&NodeId>,
    ) -> Option<T> {
        match result {
            Ok(val) => Some(val),
            Err(e) => {
                let ctx = if let Some(t) = target {
                    format!("{} from {} to {}", operation, self.node_id, t)
                } else {
                    format!("{} on {}", operation, self.node_id)
                };

                match e.severity() {
                    ErrorSeverity::Fatal => {
                        error!("[FATAL] {} failed: {}", ctx, e.context());
                    }
                    ErrorSeverity::Recoverable => {
                        warn!("[RECOVERABLE] {} failed: {}", ctx, e.context());
                    }
                    ErrorSeverity::Ignorable => {
                        info!("[IGNORABLE] {} failed: {}", ctx, e.context());
                    }
                }
                None
            }
        }
    }

    /// 处理不需要返回值的操作
    pub fn handle_void<E: ErrorHandler>(
        &self,
        result: Result<(), E>,
        operation: &str,
        target: Option<&NodeId>,
    ) -> bool {
        self.handle(result, operation, target).is_some()
    }
}
