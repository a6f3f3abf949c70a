use tracing::debug;

use crate::message::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// 复制日志：当前任期、投票记录、日志序列与提交/应用进度。
/// 所有角色共用的匹配与比较原语都在这里。
pub struct ReplicatedLog<C> {
    current_term: Term,
    voted_for: Option<NodeId>,
    entries: Vec<LogEntry<C>>,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl<C> ReplicatedLog<C> {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            entries: Vec::new(),
            commit_index: -1,
            last_applied: -1,
        }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// 提升任期。投票记录在任期增加的同时清空（唯一入口，保证
    /// 旧任期的投票不会泄漏到新任期）。
    pub fn advance_term(&mut self, term: Term) {
        debug_assert!(term > self.current_term);
        self.current_term = term;
        self.voted_for = None;
    }

    pub fn record_vote(&mut self, candidate: NodeId) {
        self.voted_for = Some(candidate);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex - 1
    }

    /// 末条目的任期，空日志为 0。
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// prev_index == -1 是空日志哨兵，恒为真。
    pub fn entry_matches(&self, index: LogIndex, term: Term) -> bool {
        index == -1 || self.term_at(index) == Some(term)
    }

    /// Raft up-to-date 比较：本日志是否严格比 (other_last_term,
    /// other_last_index) 描述的日志新。相等时两个方向都为 false。
    pub fn is_better_than(&self, other_last_term: Term, other_last_index: LogIndex) -> bool {
        (self.last_term(), self.last_index()) > (other_last_term, other_last_index)
    }

    /// 截断 prev_index 之后的现存条目，再依序追加。
    /// 前置条件：调用方已通过 entry_matches 校验 (prev_index, prev_term)。
    pub fn append_after(&mut self, prev_index: LogIndex, new_entries: Vec<LogEntry<C>>) {
        debug_assert!(prev_index >= -1 && prev_index <= self.last_index());
        // 只有未提交的投机后缀允许被截断
        debug_assert!(prev_index >= self.commit_index);
        self.entries.truncate((prev_index + 1) as usize);
        self.entries.extend(new_entries);
    }

    /// Leader 本地追加，返回新条目的索引。
    pub fn append_local(&mut self, term: Term, command: C) -> LogIndex {
        self.entries.push(LogEntry::new(term, command));
        self.last_index()
    }

    /// 提交索引只前进；且只有当前任期的条目可以通过计票提交。
    /// 更早任期的条目随其上方同任期条目的提交而传递性提交。
    pub fn advance_commit_index(&mut self, candidate: LogIndex) -> bool {
        if candidate <= self.commit_index {
            return false;
        }
        if self.term_at(candidate) != Some(self.current_term) {
            debug!(
                "commit index not advanced to {}: entry term {:?} differs from current term {}",
                candidate,
                self.term_at(candidate),
                self.current_term
            );
            return false;
        }
        self.commit_index = candidate;
        true
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn mark_applied(&mut self, index: LogIndex) {
        debug_assert!(index == self.last_applied + 1 && index <= self.commit_index);
        self.last_applied = index;
    }
}

impl<C: Clone> ReplicatedLog<C> {
    /// 取 from 起（含）的条目副本用于复制。
    pub fn entries_from(&self, from: LogIndex) -> Vec<LogEntry<C>> {
        if from <= 0 {
            return self.entries.clone();
        }
        self.entries
            .get(from as usize..)
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }
}

impl<C> Default for ReplicatedLog<C> {
    fn default() -> Self {
        Self::new()
    }
}
