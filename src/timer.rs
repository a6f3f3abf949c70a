//! 代数守卫的一次性定时器。
//!
//! 每次布防递增节点的单调代数计数并捕获新值；回调触发时若代数已经
//! 不匹配（角色已切换或节点已关闭），就静默丢弃。代数在入队前检查
//! 一次，事件处理器在锁内再检查一次，保证角色切换后的在途回调绝不
//! 改动状态。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use crate::NodeId;
use crate::event::Event;

pub struct TimerService<C> {
    node_id: NodeId,
    generation: Arc<AtomicU64>,
    event_tx: mpsc::Sender<Event<C>>,
}

impl<C: Send + 'static> TimerService<C> {
    pub fn new(
        node_id: NodeId,
        generation: Arc<AtomicU64>,
        event_tx: mpsc::Sender<Event<C>>,
    ) -> Self {
        Self {
            node_id,
            generation,
            event_tx,
        }
    }

    /// 当前代数。事件处理器用它识别过期的定时器事件。
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 使所有已布防的定时器失效，返回新代数。
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 布防选举定时器（单次）。同一节点同时至多一个定时器有效，
    /// 所以布防本身就作废了之前的布防。
    pub fn arm_election(&self, delay: Duration) -> u64 {
        self.arm(delay, |generation| Event::ElectionTimeout { generation })
    }

    /// 布防心跳定时器（单次，Leader 每次触发后重新布防）。
    pub fn arm_heartbeat(&self, delay: Duration) -> u64 {
        self.arm(delay, |generation| Event::HeartbeatTimeout { generation })
    }

    fn arm(
        &self,
        delay: Duration,
        make_event: impl FnOnce(u64) -> Event<C> + Send + 'static,
    ) -> u64 {
        let generation = self.invalidate();
        let guard = Arc::clone(&self.generation);
        let tx = self.event_tx.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.load(Ordering::Acquire) != generation {
                trace!(
                    "Node {}: timer generation {} superseded, dropping callback",
                    node_id, generation
                );
                return;
            }
            // 节点关闭后通道随之关闭，发送失败直接忽略
            let _ = tx.send(make_event(generation)).await;
        });
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (TimerService<String>, mpsc::Receiver<Event<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let svc = TimerService::new("n1".to_string(), Arc::new(AtomicU64::new(0)), tx);
        (svc, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_with_its_generation() {
        let (svc, mut rx) = service();
        let generation = svc.arm_election(Duration::from_millis(10));
        let event = rx.recv().await.expect("timer event");
        match event {
            Event::ElectionTimeout { generation: g } => assert_eq!(g, generation),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_timer_never_fires() {
        let (svc, mut rx) = service();
        svc.arm_election(Duration::from_millis(10));
        svc.invalidate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_supersedes_previous_timer() {
        let (svc, mut rx) = service();
        svc.arm_election(Duration::from_millis(10));
        let generation = svc.arm_heartbeat(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = rx.recv().await.expect("timer event");
        match event {
            Event::HeartbeatTimeout { generation: g } => assert_eq!(g, generation),
            other => panic!("unexpected event: {:?}", other),
        }
        // 被顶替的选举定时器不会再触发
        assert!(rx.try_recv().is_err());
    }
}
