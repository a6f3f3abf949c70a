// cluster.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use miniraft::mock_network::{MockNetworkConfig, MockNetworkHub};
use miniraft::{ApplyResult, LogIndex, NodeId, NodeSettings, RaftNode, Role, StateMachine};

/// 按应用顺序记录命令的测试状态机
#[derive(Default)]
pub struct VecStateMachine {
    pub applied: Mutex<Vec<(LogIndex, String)>>,
}

#[async_trait::async_trait]
impl StateMachine<String> for VecStateMachine {
    async fn apply(&self, index: LogIndex, command: &String) -> ApplyResult<()> {
        self.applied.lock().push((index, command.clone()));
        Ok(())
    }
}

pub struct TestNode {
    pub node: Arc<RaftNode<String>>,
    pub machine: Arc<VecStateMachine>,
}

/// 接线到共享 mock hub 的进程内集群
pub struct TestCluster {
    pub hub: MockNetworkHub<String>,
    pub nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    /// 创建集群（未启动）。每个节点的 peers 是除自己外的所有节点。
    pub fn new(node_ids: &[&str], hub_config: MockNetworkConfig, timeout_base_ms: u64) -> Self {
        let hub = MockNetworkHub::new(hub_config);
        let mut nodes = HashMap::new();
        for id in node_ids {
            let peers: Vec<NodeId> = node_ids
                .iter()
                .filter(|p| p != &id)
                .map(|p| p.to_string())
                .collect();
            let settings = NodeSettings {
                node_id: id.to_string(),
                peers,
                timeout_base_ms,
                heartbeat_interval_ms: timeout_base_ms / 5,
            };
            let machine = Arc::new(VecStateMachine::default());
            let node = Arc::new(RaftNode::new(
                settings,
                Arc::new(hub.transport()),
                machine.clone(),
            ));

            // 入站转发：hub 端点 -> 节点事件队列
            let mut rx = hub.register_endpoint(id.to_string());
            let forward = node.clone();
            tokio::spawn(async move {
                while let Some((from, message)) = rx.recv().await {
                    forward.deliver(from, message);
                }
            });

            nodes.insert(id.to_string(), TestNode { node, machine });
        }
        info!("TestCluster created with {} nodes", nodes.len());
        Self { hub, nodes }
    }

    pub async fn start(&self) {
        for test_node in self.nodes.values() {
            test_node.node.initialize().await;
        }
    }

    pub fn get(&self, id: &str) -> &TestNode {
        &self.nodes[id]
    }

    /// 轮询直到指定节点集合里出现恰好一个 Leader，返回其 id。
    pub async fn wait_for_leader_among(
        &self,
        ids: &[&str],
        max_wait: Duration,
    ) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let mut leaders = Vec::new();
            for id in ids {
                if self.nodes[*id].node.role().await == Role::Leader {
                    leaders.push(id.to_string());
                }
            }
            if leaders.len() == 1 {
                return leaders.pop();
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// 在整个集群里等待唯一 Leader。
    pub async fn wait_for_leader(&self, max_wait: Duration) -> Option<NodeId> {
        let ids: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        self.wait_for_leader_among(&ids, max_wait).await
    }

    pub async fn shutdown(&self) {
        for test_node in self.nodes.values() {
            test_node.node.shutdown().await;
        }
    }
}
