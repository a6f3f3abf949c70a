use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::CallbackErrorHandler;
use crate::event::Event;
use crate::log::ReplicatedLog;
use crate::message::{AppendEntries, AppendEntriesAck, GrantVote, Message, RequestVote};
use crate::node::NodeSettings;
use crate::timer::TimerService;
use crate::traits::{StateMachine, Transport};
use crate::{LogIndex, NodeId, RaftError, Term};

/// 对外可见的节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// 选举跟踪（仅 Candidate 期间存在）
#[derive(Debug, Default)]
struct CandidateState {
    votes_granted: HashSet<NodeId>,
}

/// Leader 专属复制状态，退出领导时整体丢弃
#[derive(Debug, Default)]
struct LeaderState {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    /// 每个 peer 最近一次下发的 (prev_log_index, 条数)。
    /// AppendEntriesAck 不携带索引，靠这条记录解释确认。
    last_sent: HashMap<NodeId, (LogIndex, usize)>,
}

/// 当前活跃角色。切换时整体替换，角色私有数据随之消亡。
enum RoleState {
    Follower,
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RoleState {
    fn role(&self) -> Role {
        match self {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }
}

/// 单节点共识引擎。
///
/// 所有对事件的反应都集中在这里；Node 层保证事件严格串行喂入，
/// 因此内部不需要任何锁。
pub struct RaftState<C> {
    id: NodeId,
    settings: NodeSettings,

    log: ReplicatedLog<C>,
    role: RoleState,
    /// 最近一次见到的合法 Leader（NotLeader 错误里返回给客户端）
    leader_hint: Option<NodeId>,

    transport: Arc<dyn Transport<C>>,
    state_machine: Arc<dyn StateMachine<C>>,
    timers: TimerService<C>,
    error_handler: CallbackErrorHandler,
}

impl<C: Clone + Debug + Send + Sync + 'static> RaftState<C> {
    pub(crate) fn new(
        settings: NodeSettings,
        transport: Arc<dyn Transport<C>>,
        state_machine: Arc<dyn StateMachine<C>>,
        timers: TimerService<C>,
    ) -> Self {
        Self {
            id: settings.node_id.clone(),
            error_handler: CallbackErrorHandler::new(settings.node_id.clone()),
            settings,
            log: ReplicatedLog::new(),
            role: RoleState::Follower,
            leader_hint: None,
            transport,
            state_machine,
            timers,
        }
    }

    // === 只读访问 ===

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn current_term(&self) -> Term {
        self.log.current_term()
    }

    pub fn last_commit(&self) -> LogIndex {
        self.log.commit_index()
    }

    pub fn log(&self) -> &ReplicatedLog<C> {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut ReplicatedLog<C> {
        &mut self.log
    }

    /// 激活 Follower 角色并布防首个选举定时器（Initialize 调用）。
    pub(crate) fn activate(&mut self) {
        self.role = RoleState::Follower;
        self.reset_election_timer();
        info!(
            "Node {} activated as Follower (term {}, {} peers)",
            self.id,
            self.log.current_term(),
            self.settings.peers.len()
        );
    }

    /// 处理事件（主入口）
    pub(crate) async fn handle_event(&mut self, event: Event<C>) {
        match event {
            Event::ElectionTimeout { generation } => self.handle_election_timeout(generation).await,
            Event::HeartbeatTimeout { generation } => {
                self.handle_heartbeat_timeout(generation).await
            }
            Event::Message { from, message } => self.handle_message(from, message).await,
            // Shutdown 在 Node 的工作循环里拦截，不会到达这里
            Event::Shutdown => {}
        }
    }

    async fn handle_message(&mut self, from: NodeId, message: Message<C>) {
        match message {
            Message::RequestVote(req) => self.handle_request_vote(from, req).await,
            Message::GrantVote(vote) => self.handle_vote_response(from, vote).await,
            Message::AppendEntries(req) => self.handle_append_entries(from, req).await,
            Message::AppendEntriesAck(ack) => self.handle_append_entries_ack(from, ack).await,
        }
    }

    // === 定时器 ===

    /// ±20% 抖动的选举超时，每次布防重新采样——集群各节点的
    /// 超时去同步完全依赖这一点。
    fn jittered_election_timeout(&self) -> Duration {
        let base = self.settings.timeout_base_ms;
        let min = base - base / 5;
        let span = 2 * (base / 5) + 1;
        Duration::from_millis(min + rand::random::<u64>() % span)
    }

    fn reset_election_timer(&self) {
        let timeout = self.jittered_election_timeout();
        self.timers.arm_election(timeout);
        trace!("Node {} armed election timer for {:?}", self.id, timeout);
    }

    fn reset_heartbeat_timer(&self) {
        self.timers
            .arm_heartbeat(Duration::from_millis(self.settings.heartbeat_interval_ms));
    }

    fn stale_timer(&self, generation: u64) -> bool {
        generation != self.timers.current_generation()
    }

    // === 任期与角色切换 ===

    fn adopt_term(&mut self, term: Term) {
        if term > self.log.current_term() {
            debug!(
                "Node {} updating term {} -> {}",
                self.id,
                self.log.current_term(),
                term
            );
            self.log.advance_term(term);
            self.leader_hint = None;
        }
    }

    /// Candidate/Leader 看到更合法的任期时退回 Follower。
    fn step_down(&mut self, term: Term) {
        self.adopt_term(term);
        let was = self.role.role();
        self.role = RoleState::Follower;
        if was != Role::Follower {
            info!(
                "Node {} stepping down from {} to Follower (term {})",
                self.id,
                was,
                self.log.current_term()
            );
        }
        self.reset_election_timer();
    }

    // === 选举 ===

    async fn handle_election_timeout(&mut self, generation: u64) {
        if self.stale_timer(generation) {
            trace!(
                "Node {} ignoring stale election timeout (generation {})",
                self.id, generation
            );
            return;
        }
        match self.role.role() {
            Role::Leader => {
                // Leader 没有选举定时器；代数守卫理应拦住这里
                warn!("Node {} ignoring election timeout while leader", self.id);
            }
            Role::Follower | Role::Candidate => {
                self.start_election().await;
            }
        }
    }

    /// 进入（或重启）候选状态：任期自增、给自己投票、群发拉票。
    /// 选票分裂后的超时重试也走这里，每次都拿到严格更大的任期。
    async fn start_election(&mut self) {
        let term = self.log.current_term() + 1;
        self.log.advance_term(term);
        self.log.record_vote(self.id.clone());
        self.leader_hint = None;

        let mut votes_granted = HashSet::new();
        votes_granted.insert(self.id.clone());
        self.role = RoleState::Candidate(CandidateState { votes_granted });

        info!("Node {} starting election for term {}", self.id, term);

        self.reset_election_timer();

        let req = RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_term: self.log.last_term(),
            last_log_index: self.log.last_index(),
        };
        let peers = self.settings.peers.clone();
        for peer in &peers {
            let result = self
                .transport
                .send_request_vote_request(&self.id, peer, req.clone())
                .await;
            self.error_handler
                .handle_void(result, "send_request_vote_request", Some(peer));
        }

        // 单节点集群：自己的一票即是多数
        self.try_win_election().await;
    }

    /// 多数派规模：floor(集群规模/2)+1，集群规模 = peers + 自己。
    fn majority(&self) -> usize {
        (self.settings.peers.len() + 1) / 2 + 1
    }

    async fn try_win_election(&mut self) {
        let won = match &self.role {
            RoleState::Candidate(candidate) => candidate.votes_granted.len() >= self.majority(),
            _ => return,
        };
        if won {
            self.become_leader().await;
        }
    }

    async fn become_leader(&mut self) {
        let next = self.log.last_index() + 1;
        let mut leader = LeaderState::default();
        for peer in &self.settings.peers {
            leader.next_index.insert(peer.clone(), next);
            leader.match_index.insert(peer.clone(), -1);
        }
        self.role = RoleState::Leader(leader);
        self.leader_hint = None;

        info!(
            "Node {} becomes leader for term {}",
            self.id,
            self.log.current_term()
        );

        // 立即宣告领导权（可能为空的 AppendEntries），
        // broadcast 同时布防固定间隔的心跳定时器
        self.broadcast_append_entries().await;
    }

    async fn handle_request_vote(&mut self, from: NodeId, req: RequestVote) {
        if from != req.candidate_id {
            warn!(
                "Node {} received vote request from {}, but candidate is {}",
                self.id, from, req.candidate_id
            );
            return;
        }

        // 看到不低于自己任期的候选人（Candidate）或更高任期（Leader）：
        // 先退位，再按 Follower 语义处理同一条报文
        let current = self.log.current_term();
        match self.role.role() {
            Role::Candidate if req.term >= current => self.step_down(req.term),
            Role::Leader if req.term > current => self.step_down(req.term),
            _ => {}
        }

        let granted = self.decide_vote(&req);
        if granted {
            self.log.record_vote(req.candidate_id.clone());
            // 投出一票说明集群别处有活跃的选举，推迟自己的候选
            self.reset_election_timer();
            info!(
                "Node {} grants vote to {} for term {}",
                self.id,
                req.candidate_id,
                self.log.current_term()
            );
        }

        let reply = GrantVote {
            granted,
            voter_id: self.id.clone(),
            term: self.log.current_term(),
        };
        let result = self
            .transport
            .send_request_vote_response(&self.id, &req.candidate_id, reply)
            .await;
        self.error_handler
            .handle_void(result, "send_request_vote_response", Some(&req.candidate_id));
    }

    /// 投票决策。任期不高于当前者一律拒绝；更高任期先采纳，再按
    /// 日志新旧与投票记录决定。
    fn decide_vote(&mut self, req: &RequestVote) -> bool {
        if req.term <= self.log.current_term() {
            trace!(
                "Node {} declines vote for {}: term {} not newer than {}",
                self.id,
                req.candidate_id,
                req.term,
                self.log.current_term()
            );
            return false;
        }

        self.adopt_term(req.term);

        if self.log.is_better_than(req.last_log_term, req.last_log_index) {
            trace!(
                "Node {} declines vote for {}: own log is more up to date",
                self.id, req.candidate_id
            );
            return false;
        }
        match self.log.voted_for() {
            None => true,
            Some(voted) if *voted == req.candidate_id => true,
            Some(other) => {
                trace!(
                    "Node {} declines vote for {}: already voted for {}",
                    self.id, req.candidate_id, other
                );
                false
            }
        }
    }

    async fn handle_vote_response(&mut self, from: NodeId, vote: GrantVote) {
        if from != vote.voter_id {
            warn!(
                "Node {} received vote response from {}, but voter is {}",
                self.id, from, vote.voter_id
            );
            return;
        }

        // 任何携带更高任期的报文：采纳并退回 Follower
        if vote.term > self.log.current_term() {
            self.step_down(vote.term);
            return;
        }

        let majority = self.majority();
        let role = self.role.role();
        let RoleState::Candidate(candidate) = &mut self.role else {
            // Follower/Leader 收到的投票都是过期的，丢弃
            debug!("Node {} discards vote response while {}", self.id, role);
            return;
        };

        if vote.term < self.log.current_term() {
            debug!(
                "Node {} discards stale vote response (term {})",
                self.id, vote.term
            );
            return;
        }
        if !self.settings.peers.contains(&vote.voter_id) {
            warn!(
                "Node {} received vote from unknown peer {}",
                self.id, vote.voter_id
            );
            return;
        }

        if vote.granted {
            candidate.votes_granted.insert(vote.voter_id.clone());
            info!(
                "Node {} got vote from {} ({}/{} for term {})",
                self.id,
                vote.voter_id,
                candidate.votes_granted.len(),
                majority,
                self.log.current_term()
            );
            self.try_win_election().await;
        }
    }

    // === 日志复制 ===

    async fn handle_heartbeat_timeout(&mut self, generation: u64) {
        if self.stale_timer(generation) {
            trace!(
                "Node {} ignoring stale heartbeat timeout (generation {})",
                self.id, generation
            );
            return;
        }
        if !matches!(self.role, RoleState::Leader(_)) {
            return;
        }
        self.broadcast_append_entries().await;
    }

    /// 向每个 peer 发送从其 next_index 起的日志（可能为空，即心跳），
    /// 并重新布防心跳定时器。
    async fn broadcast_append_entries(&mut self) {
        self.reset_heartbeat_timer();

        let peers = self.settings.peers.clone();
        for peer in &peers {
            let Some((req, sent)) = self.build_append_request(peer) else {
                continue;
            };
            if !req.entries.is_empty() {
                debug!(
                    "Node {} sending {} entries to {}: prev_log_index={}",
                    self.id, sent, peer, req.prev_log_index
                );
            }
            // 记录本次下发，ack 到达时据此推进 match_index
            if let RoleState::Leader(leader) = &mut self.role {
                leader
                    .last_sent
                    .insert(peer.clone(), (req.prev_log_index, sent));
            }
            let result = self
                .transport
                .send_append_entries_request(&self.id, peer, req)
                .await;
            self.error_handler
                .handle_void(result, "send_append_entries_request", Some(peer));
        }
    }

    fn build_append_request(&self, peer: &NodeId) -> Option<(AppendEntries<C>, usize)> {
        let RoleState::Leader(leader) = &self.role else {
            return None;
        };
        let next = leader.next_index.get(peer).copied().unwrap_or(0);
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index < 0 {
            0
        } else {
            self.log.term_at(prev_log_index).unwrap_or(0)
        };
        let entries = self.log.entries_from(next);
        let sent = entries.len();
        let req = AppendEntries {
            leader_term: self.log.current_term(),
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
        };
        Some((req, sent))
    }

    async fn handle_append_entries(&mut self, from: NodeId, req: AppendEntries<C>) {
        if from != req.leader_id {
            warn!(
                "Node {} received append entries from {}, but leader is {}",
                self.id, from, req.leader_id
            );
            return;
        }

        // Candidate 看到任期不低于自己的 Leader、任何角色看到更高任期：
        // 退位后按 Follower 语义继续处理本条报文
        let current = self.log.current_term();
        match self.role.role() {
            Role::Candidate if req.leader_term >= current => self.step_down(req.leader_term),
            Role::Leader if req.leader_term > current => self.step_down(req.leader_term),
            Role::Follower if req.leader_term > current => self.adopt_term(req.leader_term),
            _ => {}
        }

        match self.role.role() {
            Role::Leader => {
                // 选举安全性保证同任期不会有第二个 Leader，
                // 走到这里只可能是过期 Leader：拒绝以促其退位
                debug!(
                    "Node {} (leader, term {}) rejects append entries from {} (term {})",
                    self.id,
                    self.log.current_term(),
                    from,
                    req.leader_term
                );
                self.send_append_ack(&req.leader_id, false).await;
                return;
            }
            Role::Candidate => {
                // 任期不低于自己的情况已经在上面退位，剩下的是过期 Leader
                debug!(
                    "Node {} (candidate) rejects append entries from stale leader {}",
                    self.id, from
                );
                self.send_append_ack(&req.leader_id, false).await;
                return;
            }
            Role::Follower => {}
        }

        let success = if req.leader_term < self.log.current_term() {
            debug!(
                "Node {} rejects append entries from stale leader {} (term {} < {})",
                self.id,
                from,
                req.leader_term,
                self.log.current_term()
            );
            false
        } else {
            self.leader_hint = Some(req.leader_id.clone());
            if self.log.entry_matches(req.prev_log_index, req.prev_log_term) {
                if !req.entries.is_empty() {
                    debug!(
                        "Node {} appending {} entries after index {}",
                        self.id,
                        req.entries.len(),
                        req.prev_log_index
                    );
                }
                self.log.append_after(req.prev_log_index, req.entries);
                true
            } else {
                // 日志不匹配：拒绝，Leader 会回退 next_index 继续向前探测
                debug!(
                    "Node {} rejects append entries: no entry matching (index {}, term {})",
                    self.id, req.prev_log_index, req.prev_log_term
                );
                false
            }
        };

        self.send_append_ack(&req.leader_id, success).await;
        // 任何 AppendEntries 都算心跳：收到即重置选举定时器，
        // 即使这次复制被拒绝
        self.reset_election_timer();
    }

    async fn send_append_ack(&mut self, leader: &NodeId, success: bool) {
        let ack = AppendEntriesAck {
            follower_id: self.id.clone(),
            term: self.log.current_term(),
            success,
        };
        let result = self
            .transport
            .send_append_entries_response(&self.id, leader, ack)
            .await;
        self.error_handler
            .handle_void(result, "send_append_entries_response", Some(leader));
    }

    async fn handle_append_entries_ack(&mut self, from: NodeId, ack: AppendEntriesAck) {
        if from != ack.follower_id {
            warn!(
                "Node {} received ack from {}, but follower is {}",
                self.id, from, ack.follower_id
            );
            return;
        }

        if ack.term > self.log.current_term() {
            self.step_down(ack.term);
            return;
        }

        let role = self.role.role();
        let RoleState::Leader(leader) = &mut self.role else {
            debug!("Node {} discards append entries ack while {}", self.id, role);
            return;
        };
        if !self.settings.peers.contains(&ack.follower_id) {
            warn!(
                "Node {} received ack from unknown peer {}",
                self.id, ack.follower_id
            );
            return;
        }

        if ack.success {
            let Some(&(prev, sent)) = leader.last_sent.get(&ack.follower_id) else {
                debug!(
                    "Node {} got ack from {} with no outstanding batch",
                    self.id, from
                );
                return;
            };
            let acked = prev + sent as LogIndex;
            let matched = leader.match_index.entry(ack.follower_id.clone()).or_insert(-1);
            // 重复送达的 ack 不允许把 match_index 拉回去
            if acked > *matched {
                *matched = acked;
            }
            let matched = *matched;
            leader.next_index.insert(ack.follower_id.clone(), matched + 1);
            trace!("Node {}: peer {} matched up to {}", self.id, from, matched);
            self.try_advance_commit().await;
        } else {
            // 日志不匹配：回退一格，下个心跳向更早的前缀探测
            let next = leader.next_index.entry(ack.follower_id.clone()).or_insert(0);
            if *next > 0 {
                *next -= 1;
            }
            let next = *next;
            // 该批次作废
            leader.last_sent.remove(&ack.follower_id);
            debug!(
                "Node {}: peer {} rejected append, next_index backed off to {}",
                self.id, from, next
            );
        }
    }

    /// 重新计算多数派已持有的最高索引并尝试推进提交。
    async fn try_advance_commit(&mut self) {
        let candidate = {
            let RoleState::Leader(leader) = &self.role else {
                return;
            };
            let mut matched: Vec<LogIndex> = leader.match_index.values().copied().collect();
            matched.push(self.log.last_index());
            matched.sort_unstable_by(|a, b| b.cmp(a));
            matched[self.majority() - 1]
        };
        if candidate < 0 {
            return;
        }
        if self.log.advance_commit_index(candidate) {
            info!("Node {} advanced commit index to {}", self.id, candidate);
            self.apply_committed().await;
        }
    }

    /// 把 (last_applied, commit_index] 区间的条目按序交给状态机。
    async fn apply_committed(&mut self) {
        while self.log.last_applied() < self.log.commit_index() {
            let index = self.log.last_applied() + 1;
            let command = match self.log.entries().get(index as usize) {
                Some(entry) => entry.command.clone(),
                None => {
                    warn!(
                        "Node {}: committed entry {} missing from log",
                        self.id, index
                    );
                    return;
                }
            };
            let result = self.state_machine.apply(index, &command).await;
            if self.error_handler.handle_void(result, "apply", None) {
                self.log.mark_applied(index);
            } else {
                // 应用失败：不推进 last_applied，下次提交推进时重试
                return;
            }
        }
    }

    // === 客户端提交 ===

    /// 客户端命令提交。只有 Leader 接受；命令以当前任期追加到日志，
    /// 复制由心跳机制完成。
    pub(crate) async fn propose(&mut self, command: C) -> Result<LogIndex, RaftError> {
        if !matches!(self.role, RoleState::Leader(_)) {
            return Err(RaftError::NotLeader(self.leader_hint.clone()));
        }
        let term = self.log.current_term();
        let index = self.log.append_local(term, command);
        debug!(
            "Node {} accepted command at index {} (term {})",
            self.id, index, term
        );
        // 单节点集群没有 ack，提交推进在这里完成
        self.try_advance_commit().await;
        Ok(index)
    }
}
