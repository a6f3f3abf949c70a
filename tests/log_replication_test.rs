//! 日志复制场景测试：预置日志的 Leader 把日志同步给
//! 脚本化/真实的跟随者，并正确确立提交索引。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use miniraft::mock_network::{MockNetworkConfig, MockNetworkHub, MockTransport};
use miniraft::{
    AppendEntriesAck, GrantVote, LogEntry, LogIndex, Message, NodeSettings, RaftNode, Role,
    Transport,
};

mod common;
use common::cluster::VecStateMachine;

fn entries(cmds: &[&str]) -> Vec<LogEntry<String>> {
    cmds.iter().map(|c| LogEntry::new(1, c.to_string())).collect()
}

struct Harness {
    leader: Arc<RaftNode<String>>,
    machine: Arc<VecStateMachine>,
    /// 脚本跟随者当前持有的条目数
    replicated: Arc<AtomicI64>,
}

/// 搭建两节点场景：节点 "1" 为待选 Leader，节点 "2" 是脚本化端点——
/// 照单全收投票请求，并按自己已持有的日志长度如实确认复制请求。
async fn scripted_pair(seed: &[&str], timeout_base_ms: u64) -> Harness {
    let hub: MockNetworkHub<String> = MockNetworkHub::new(MockNetworkConfig::reliable());
    let machine = Arc::new(VecStateMachine::default());
    let leader = Arc::new(RaftNode::new(
        NodeSettings {
            node_id: "1".to_string(),
            peers: vec!["2".to_string()],
            timeout_base_ms,
            heartbeat_interval_ms: 2,
        },
        Arc::new(hub.transport()),
        machine.clone(),
    ));

    // 启动前注入日志
    leader.seed_log(entries(seed)).await;

    // 节点 1 入站接线
    let mut rx1 = hub.register_endpoint("1".to_string());
    {
        let forward = leader.clone();
        tokio::spawn(async move {
            while let Some((from, message)) = rx1.recv().await {
                forward.deliver(from, message);
            }
        });
    }

    // 节点 2：脚本化跟随者
    let mut rx2 = hub.register_endpoint("2".to_string());
    let transport: MockTransport<String> = hub.transport();
    let replicated = Arc::new(AtomicI64::new(0));
    {
        let replicated = replicated.clone();
        tokio::spawn(async move {
            let me = "2".to_string();
            let peer = "1".to_string();
            while let Some((_, message)) = rx2.recv().await {
                match message {
                    Message::RequestVote(req) => {
                        let _ = transport
                            .send_request_vote_response(
                                &me,
                                &peer,
                                GrantVote {
                                    granted: true,
                                    voter_id: me.clone(),
                                    term: req.term,
                                },
                            )
                            .await;
                    }
                    Message::AppendEntries(req) => {
                        let held = replicated.load(Ordering::Acquire);
                        let success = req.prev_log_index == held - 1;
                        if success {
                            replicated
                                .store(held + req.entries.len() as i64, Ordering::Release);
                        }
                        let _ = transport
                            .send_append_entries_response(
                                &me,
                                &peer,
                                AppendEntriesAck {
                                    follower_id: me.clone(),
                                    term: req.leader_term,
                                    success,
                                },
                            )
                            .await;
                    }
                    _ => {}
                }
            }
        });
    }

    leader.initialize().await;
    Harness {
        leader,
        machine,
        replicated,
    }
}

async fn wait_until<F: Fn() -> bool>(max_wait: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_commit(node: &RaftNode<String>, expected: LogIndex, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if node.last_commit().await >= expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn empty_follower_log_is_filled() {
    let _ = tracing_subscriber::fmt().try_init();
    let harness = scripted_pair(&["one", "two"], 10).await;

    // 3000ms 内副本收敛到 2 条（Leader 从 next_index=2 回退到 -1 再补齐）
    let replicated = harness.replicated.clone();
    let converged = wait_until(Duration::from_millis(3000), || {
        replicated.load(Ordering::Acquire) == 2
    })
    .await;
    assert!(converged, "follower log did not converge in time");

    // 多数确认后提交索引确立在 1（0 起始）
    assert!(wait_for_commit(&harness.leader, 1, Duration::from_millis(3000)).await);
    assert_eq!(harness.leader.last_commit().await, 1);
    harness.leader.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commit_index_is_properly_established() {
    let _ = tracing_subscriber::fmt().try_init();
    let harness = scripted_pair(&["one", "two", "3"], 10).await;

    let replicated = harness.replicated.clone();
    let converged = wait_until(Duration::from_millis(3000), || {
        replicated.load(Ordering::Acquire) == 3
    })
    .await;
    assert!(converged, "follower log did not converge in time");

    assert!(wait_for_commit(&harness.leader, 2, Duration::from_millis(3000)).await);

    // 提交的条目按序交给了状态机
    let applied = harness.machine.applied.lock().clone();
    assert_eq!(
        applied,
        vec![
            (0, "one".to_string()),
            (1, "two".to_string()),
            (2, "3".to_string())
        ]
    );
    harness.leader.shutdown().await;
}

/// 真实两节点：Leader 通过逐格回退 next_index 找到空跟随者的
/// 匹配前缀（-1 哨兵），再整体补齐日志。
#[tokio::test(start_paused = true)]
async fn leader_backtracks_to_fill_lagging_follower() {
    let _ = tracing_subscriber::fmt().try_init();
    let hub: MockNetworkHub<String> = MockNetworkHub::new(MockNetworkConfig::reliable());

    let mut nodes = Vec::new();
    // node2 的超时远大于 node1，保证 node1 当选
    for (id, timeout_base_ms) in [("1", 20u64), ("2", 10_000u64)] {
        let peer = if id == "1" { "2" } else { "1" };
        let machine = Arc::new(VecStateMachine::default());
        let node = Arc::new(RaftNode::new(
            NodeSettings {
                node_id: id.to_string(),
                peers: vec![peer.to_string()],
                timeout_base_ms,
                heartbeat_interval_ms: 4,
            },
            Arc::new(hub.transport()),
            machine.clone(),
        ));
        let mut rx = hub.register_endpoint(id.to_string());
        let forward = node.clone();
        tokio::spawn(async move {
            while let Some((from, message)) = rx.recv().await {
                forward.deliver(from, message);
            }
        });
        nodes.push((node, machine));
    }
    let (leader, leader_machine) = &nodes[0];
    let (follower, _) = &nodes[1];

    leader.seed_log(entries(&["one", "two", "three"])).await;
    leader.initialize().await;
    follower.initialize().await;

    // 跟随者日志收敛到与 Leader 一致
    let deadline = tokio::time::Instant::now() + Duration::from_millis(3000);
    loop {
        if follower.log_entries().await.len() == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower log did not converge in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(follower.log_entries().await, leader.log_entries().await);
    assert_eq!(leader.role().await, Role::Leader);
    assert_eq!(follower.role().await, Role::Follower);

    // 多数派确认后 Leader 提交并应用全部三条
    assert!(wait_for_commit(leader, 2, Duration::from_millis(3000)).await);
    let applied = leader_machine.applied.lock().clone();
    assert_eq!(
        applied,
        vec![
            (0, "one".to_string()),
            (1, "two".to_string()),
            (2, "three".to_string())
        ]
    );

    leader.shutdown().await;
    follower.shutdown().await;
}
