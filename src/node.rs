use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RaftError;
use crate::event::Event;
use crate::message::{LogEntry, Message};
use crate::state::{RaftState, Role};
use crate::timer::TimerService;
use crate::traits::{StateMachine, Transport};
use crate::{LogIndex, NodeId, Term};

/// 事件通道容量（提供背压保护）
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 节点配置。构造后不可变。
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: NodeId,
    /// 集群中除自己以外的节点
    pub peers: Vec<NodeId>,
    /// 选举超时基准（毫秒），每次布防在 ±20% 内抖动
    pub timeout_base_ms: u64,
    /// Leader 心跳间隔（毫秒）。固定不抖动，须明显小于选举超时下限
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            peers: Vec::new(),
            timeout_base_ms: 500,
            heartbeat_interval_ms: 50,
        }
    }
}

/// 可寻址的 Raft 节点。
///
/// 持有共识引擎、入站事件队列与公开生命周期。构造后处于待命状态；
/// `initialize` 启动单一工作循环并激活 Follower 角色；`shutdown`
/// 幂等地作废所有定时器并停止事件处理。消息处理与定时器回调都经由
/// 同一把锁串行执行，同一节点绝不会有两个反应并发。
pub struct RaftNode<C> {
    id: NodeId,
    state: Arc<Mutex<RaftState<C>>>,
    event_tx: mpsc::Sender<Event<C>>,
    event_rx: Mutex<Option<mpsc::Receiver<Event<C>>>>,
    generation: Arc<AtomicU64>,
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clone + Debug + Send + Sync + 'static> RaftNode<C> {
    pub fn new(
        settings: NodeSettings,
        transport: Arc<dyn Transport<C>>,
        state_machine: Arc<dyn StateMachine<C>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let generation = Arc::new(AtomicU64::new(0));
        let timers = TimerService::new(
            settings.node_id.clone(),
            Arc::clone(&generation),
            event_tx.clone(),
        );
        let id = settings.node_id.clone();
        let state = RaftState::new(settings, transport, state_machine, timers);
        Self {
            id,
            state: Arc::new(Mutex::new(state)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            generation,
            started: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// 激活节点：启动事件工作循环，激活 Follower 角色并布防首个
    /// 选举定时器。重复调用是空操作。
    pub async fn initialize(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Node {} already initialized", self.id);
            return;
        }
        let Some(mut event_rx) = self.event_rx.lock().await.take() else {
            return;
        };

        {
            let mut state = self.state.lock().await;
            state.activate();
        }

        let state = Arc::clone(&self.state);
        let stopped = Arc::clone(&self.stopped);
        let id = self.id.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if stopped.load(Ordering::Acquire) || matches!(event, Event::Shutdown) {
                    debug!("Node {} worker loop exiting", id);
                    break;
                }
                let mut guard = state.lock().await;
                guard.handle_event(event).await;
            }
        });
        *self.worker.lock().await = Some(handle);
        info!("Node {} initialized", self.id);
    }

    /// 入站报文投递（传输层的回调半边）。有界队列满时丢弃——
    /// 协议天然容忍消息丢失，由下个心跳/超时周期弥补。
    pub fn deliver(&self, from: NodeId, message: Message<C>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.event_tx.try_send(Event::Message { from, message }) {
            warn!("Node {} dropping inbound message: {}", self.id, err);
        }
    }

    /// 提交客户端命令。Leader 返回接受的日志索引；
    /// 非 Leader 返回 NotLeader（附最近见到的 Leader 提示）。
    pub async fn submit_command(&self, command: C) -> Result<LogIndex, RaftError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let mut state = self.state.lock().await;
        state.propose(command).await
    }

    /// 关闭节点（幂等）：作废所有定时器、停止工作循环、丢弃后续投递。
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // 代数一跳，所有在途定时器回调都成为空操作
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = self.event_tx.try_send(Event::Shutdown);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        info!("Node {} shut down", self.id);
    }

    // === 观测/测试访问 ===

    pub async fn current_term(&self) -> Term {
        self.state.lock().await.current_term()
    }

    pub async fn last_commit(&self) -> LogIndex {
        self.state.lock().await.last_commit()
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role()
    }

    /// 日志内容快照
    pub async fn log_entries(&self) -> Vec<LogEntry<C>> {
        self.state.lock().await.log().entries().to_vec()
    }

    /// 在 initialize 之前注入日志条目（引导/测试用）。
    pub async fn seed_log(&self, entries: Vec<LogEntry<C>>) {
        let mut state = self.state.lock().await;
        let prev = state.log().last_index();
        state.log_mut().append_after(prev, entries);
    }
}
