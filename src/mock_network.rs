//! 进程内模拟网络。
//!
//! 测试与嵌入式模拟用的中心枢纽：按节点注册入站端点，发送端共享一个
//! `Transport` 句柄。支持基础延迟、随机抖动、按概率丢包，以及把单个
//! 节点整体隔离（模拟网络分区）。协议核心对丢失/重复/乱序免疫，
//! 这里故意不保证任何送达性质。

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::NodeId;
use crate::error::RpcError;
use crate::message::{AppendEntries, AppendEntriesAck, GrantVote, Message, RequestVote};
use crate::traits::{RpcResult, Transport};

/// 模拟网络行为的配置
#[derive(Debug, Clone)]
pub struct MockNetworkConfig {
    /// 基础延迟 (毫秒)
    pub base_latency_ms: u64,
    /// 额外随机延迟的最大值 (毫秒)
    pub jitter_max_ms: u64,
    /// 消息丢失的概率 (0.0 - 1.0)
    pub drop_rate: f64,
}

impl Default for MockNetworkConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 10,
            jitter_max_ms: 50,
            drop_rate: 0.05,
        }
    }
}

impl MockNetworkConfig {
    /// 零延迟、不丢包的可靠配置（确定性测试用）
    pub fn reliable() -> Self {
        Self {
            base_latency_ms: 0,
            jitter_max_ms: 0,
            drop_rate: 0.0,
        }
    }
}

/// 投递给端点的入站项：(发送者, 报文)
pub type Inbound<C> = (NodeId, Message<C>);

struct HubInner<C> {
    config: MockNetworkConfig,
    /// 每个节点的入站发送端
    node_senders: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Inbound<C>>>>,
    /// 被隔离的节点：发出与收到的消息都被丢弃
    isolated: RwLock<HashSet<NodeId>>,
}

/// 模拟网络的中心枢纽
pub struct MockNetworkHub<C> {
    inner: Arc<HubInner<C>>,
}

impl<C> Clone for MockNetworkHub<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clone + Debug + Send + Sync + 'static> MockNetworkHub<C> {
    pub fn new(config: MockNetworkConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                node_senders: RwLock::new(HashMap::new()),
                isolated: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// 注册端点，返回入站接收端。同名重复注册会替换旧端点。
    pub fn register_endpoint(&self, node_id: NodeId) -> mpsc::UnboundedReceiver<Inbound<C>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.node_senders.write().insert(node_id, tx);
        rx
    }

    /// 获取传输句柄。句柄可被集群内所有节点共享，
    /// send 的 from 参数标识实际发送者。
    pub fn transport(&self) -> MockTransport<C> {
        MockTransport { hub: self.clone() }
    }

    /// 隔离节点：之后它发出和收到的消息都被丢弃
    pub fn isolate_node(&self, node_id: &NodeId) {
        self.inner.isolated.write().insert(node_id.clone());
        debug!("mock network: isolated node {}", node_id);
    }

    /// 解除隔离
    pub fn restore_node(&self, node_id: &NodeId) {
        self.inner.isolated.write().remove(node_id);
        debug!("mock network: restored node {}", node_id);
    }

    fn dispatch(&self, from: &NodeId, target: &NodeId, message: Message<C>) -> RpcResult<()> {
        {
            let isolated = self.inner.isolated.read();
            if isolated.contains(from) || isolated.contains(target) {
                trace!("mock network: dropping {} -> {} (isolated)", from, target);
                // 对发送方而言与网络丢包无异
                return Ok(());
            }
        }
        if self.inner.config.drop_rate > 0.0 && rand::random::<f64>() < self.inner.config.drop_rate
        {
            trace!("mock network: randomly dropping {} -> {}", from, target);
            return Ok(());
        }

        let sender = self
            .inner
            .node_senders
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))?;

        let mut delay_ms = self.inner.config.base_latency_ms;
        if self.inner.config.jitter_max_ms > 0 {
            delay_ms += rand::random::<u64>() % self.inner.config.jitter_max_ms;
        }

        let from = from.clone();
        if delay_ms == 0 {
            let _ = sender.send((from, message));
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                // 接收端已注销则静默丢弃
                let _ = sender.send((from, message));
            });
        }
        Ok(())
    }
}

/// 基于枢纽的传输实现
pub struct MockTransport<C> {
    hub: MockNetworkHub<C>,
}

impl<C> Clone for MockTransport<C> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

#[async_trait]
impl<C: Clone + Debug + Send + Sync + 'static> Transport<C> for MockTransport<C> {
    async fn send_request_vote_request(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: RequestVote,
    ) -> RpcResult<()> {
        self.hub.dispatch(from, target, Message::RequestVote(args))
    }

    async fn send_request_vote_response(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: GrantVote,
    ) -> RpcResult<()> {
        self.hub.dispatch(from, target, Message::GrantVote(args))
    }

    async fn send_append_entries_request(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: AppendEntries<C>,
    ) -> RpcResult<()> {
        self.hub.dispatch(from, target, Message::AppendEntries(args))
    }

    async fn send_append_entries_response(
        &self,
        from: &NodeId,
        target: &NodeId,
        args: AppendEntriesAck,
    ) -> RpcResult<()> {
        self.hub
            .dispatch(from, target, Message::AppendEntriesAck(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> MockNetworkHub<String> {
        MockNetworkHub::new(MockNetworkConfig::reliable())
    }

    fn vote(term: u64) -> RequestVote {
        RequestVote {
            term,
            candidate_id: "a".to_string(),
            last_log_term: 0,
            last_log_index: -1,
        }
    }

    #[tokio::test]
    async fn message_reaches_registered_endpoint() {
        let hub = hub();
        let mut rx = hub.register_endpoint("b".to_string());
        let transport = hub.transport();

        transport
            .send_request_vote_request(&"a".to_string(), &"b".to_string(), vote(1))
            .await
            .unwrap();

        let (from, message) = rx.recv().await.unwrap();
        assert_eq!(from, "a");
        assert!(matches!(message, Message::RequestVote(r) if r.term == 1));
    }

    #[tokio::test]
    async fn unknown_target_is_an_rpc_error() {
        let hub = hub();
        let transport = hub.transport();
        let err = transport
            .send_request_vote_request(&"a".to_string(), &"nowhere".to_string(), vote(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn isolated_node_sends_and_receives_nothing() {
        let hub = hub();
        let mut rx_b = hub.register_endpoint("b".to_string());
        let transport = hub.transport();

        hub.isolate_node(&"a".to_string());
        transport
            .send_request_vote_request(&"a".to_string(), &"b".to_string(), vote(1))
            .await
            .unwrap();
        assert!(rx_b.try_recv().is_err());

        hub.restore_node(&"a".to_string());
        transport
            .send_request_vote_request(&"a".to_string(), &"b".to_string(), vote(2))
            .await
            .unwrap();
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_delivery() {
        let hub = MockNetworkHub::<String>::new(MockNetworkConfig {
            base_latency_ms: 20,
            jitter_max_ms: 0,
            drop_rate: 0.0,
        });
        let mut rx = hub.register_endpoint("b".to_string());
        let transport = hub.transport();

        transport
            .send_request_vote_request(&"a".to_string(), &"b".to_string(), vote(1))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_ok());
    }
}
