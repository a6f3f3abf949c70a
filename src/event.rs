use crate::NodeId;
use crate::message::Message;

/// Raft 事件定义（输入）
///
/// 每个节点的全部反应都由这一个字母表驱动：定时器到期、入站报文、
/// 关闭信号。定时器事件携带布防时捕获的代数，处理器据此丢弃
/// 角色切换之后才触发的过期回调。
#[derive(Debug, Clone)]
pub enum Event<C> {
    // 定时器事件
    /// 选举超时（Follower/Candidate 触发）
    ElectionTimeout { generation: u64 },
    /// 心跳间隔到期（Leader 触发日志同步）
    HeartbeatTimeout { generation: u64 },

    /// 来自其他节点的入站报文
    Message { from: NodeId, message: Message<C> },

    /// 停止事件循环
    Shutdown,
}
