//! 同步核心 - 单写者状态机
//!
//! 不做 I/O：驱动方通过 `Ticket` 发起请求，完成后把结果交回核心。
//! 每个票据带会话代数（generation）和全局递增序号（seq）：
//! - 代数不匹配的完成结果直接丢弃（会话已结束或已更换）
//! - 未读计数只接受比当前已采纳序号更新的请求（按发起顺序，而非到达顺序）

use tracing::{debug, info, warn};

use super::snapshot::{NotificationSnapshot, SyncState};
use crate::adapter::{AuthContext, NotificationPage};
use crate::error::SyncError;
use crate::notification::{Completeness, Notification, NotificationId, NotificationStore};

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    List,
    Count,
    MarkOne(NotificationId),
    MarkAll,
}

/// 请求票据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub generation: u64,
    pub seq: u64,
    pub kind: RequestKind,
}

/// 同步核心
#[derive(Debug)]
pub struct SyncCore {
    state: SyncState,
    generation: u64,
    next_seq: u64,
    /// 已采纳的最新计数来源序号（count 或完整列表重算，或本地已读标记）
    count_seq: u64,
    session: Option<AuthContext>,
    store: Option<NotificationStore>,
    retention: usize,
    lists_in_flight: usize,
    last_refresh_failed: bool,
    auth_required: bool,
    failed_confirmations: u64,
}

impl SyncCore {
    pub fn new(retention: usize) -> Self {
        Self {
            state: SyncState::Idle,
            generation: 0,
            next_seq: 1,
            count_seq: 0,
            session: None,
            store: None,
            retention,
            lists_in_flight: 0,
            last_refresh_failed: false,
            auth_required: false,
            failed_confirmations: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> Option<&AuthContext> {
        self.session.as_ref()
    }

    pub fn store(&self) -> Option<&NotificationStore> {
        self.store.as_ref()
    }

    /// 开始会话，返回首次同步的 list/count 票据
    ///
    /// 同一身份重复登录是幂等的；换了身份会先结束旧会话。
    pub fn begin_session(&mut self, auth: AuthContext) -> Vec<Ticket> {
        if let Some(current) = &self.session {
            if current.identity == auth.identity && self.state != SyncState::Idle {
                debug!(identity = %auth.identity, "Session already active");
                // 只更新 token
                self.session = Some(auth);
                return Vec::new();
            }
            self.end_session();
        }

        self.generation += 1;
        self.state = SyncState::Syncing;
        self.store = Some(NotificationStore::with_retention(self.retention));
        self.count_seq = 0;
        self.lists_in_flight = 0;
        self.last_refresh_failed = false;
        self.auth_required = false;
        self.failed_confirmations = 0;
        info!(identity = %auth.identity, generation = self.generation, "Notification session started");
        self.session = Some(auth);

        [RequestKind::List, RequestKind::Count]
            .into_iter()
            .filter_map(|kind| self.issue(kind))
            .collect()
    }

    /// 结束会话：丢弃存储，使所有在途请求失效
    pub fn end_session(&mut self) {
        if self.state == SyncState::Idle && self.session.is_none() {
            return;
        }
        info!(generation = self.generation, "Notification session ended");
        self.generation += 1;
        self.state = SyncState::Idle;
        self.session = None;
        self.store = None;
        self.lists_in_flight = 0;
    }

    /// 发起一次请求，空闲时返回 None
    pub fn issue(&mut self, kind: RequestKind) -> Option<Ticket> {
        if self.state == SyncState::Idle {
            return None;
        }
        let ticket = Ticket {
            generation: self.generation,
            seq: self.next_seq,
            kind,
        };
        self.next_seq += 1;
        if kind == RequestKind::List {
            self.lists_in_flight += 1;
        }
        Some(ticket)
    }

    /// 刷新票据：总是 count，`full` 时加上 list
    pub fn refresh_tickets(&mut self, full: bool) -> Vec<Ticket> {
        let mut kinds = Vec::with_capacity(2);
        if full {
            kinds.push(RequestKind::List);
        }
        kinds.push(RequestKind::Count);
        kinds.into_iter().filter_map(|kind| self.issue(kind)).collect()
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        ticket.generation == self.generation && self.state != SyncState::Idle
    }

    /// 占用一个序号作为计数下限，使之前发起的 count 结果失效
    fn fence_count(&mut self) {
        self.count_seq = self.next_seq;
        self.next_seq += 1;
    }

    /// 合并列表结果
    pub fn apply_list(&mut self, ticket: Ticket, result: Result<NotificationPage, SyncError>) {
        if !self.is_current(&ticket) {
            debug!(seq = ticket.seq, generation = ticket.generation, "Discarding stale list completion");
            return;
        }
        self.lists_in_flight = self.lists_in_flight.saturating_sub(1);

        match result {
            Ok(page) => {
                let recompute = page.completeness == Completeness::Complete && ticket.seq > self.count_seq;
                if page.completeness == Completeness::Complete && !recompute {
                    debug!(seq = ticket.seq, count_seq = self.count_seq, "List older than latest count, merging without recount");
                }
                if recompute {
                    self.count_seq = ticket.seq;
                }
                let completeness = if recompute {
                    Completeness::Complete
                } else {
                    Completeness::Partial
                };

                if let Some(store) = self.store.as_mut() {
                    store.upsert_many(page.items, completeness);
                    store.evict_overflow();
                }
                self.last_refresh_failed = false;
                if self.state == SyncState::Syncing {
                    self.state = SyncState::Live;
                    info!(generation = self.generation, "Initial notification sync complete");
                }
            }
            Err(e) => self.handle_fetch_failure(ticket, e),
        }
    }

    /// 采纳未读计数（按序号拒绝过期结果）
    pub fn apply_count(&mut self, ticket: Ticket, result: Result<u64, SyncError>) {
        if !self.is_current(&ticket) {
            debug!(seq = ticket.seq, generation = ticket.generation, "Discarding stale count completion");
            return;
        }

        match result {
            Ok(count) => {
                if ticket.seq <= self.count_seq {
                    debug!(seq = ticket.seq, count_seq = self.count_seq, count, "Ignoring count overtaken by newer request");
                    return;
                }
                self.count_seq = ticket.seq;
                if let Some(store) = self.store.as_mut() {
                    store.set_unread_count(i64::try_from(count).unwrap_or(i64::MAX));
                }
                self.last_refresh_failed = false;
            }
            Err(e) => self.handle_fetch_failure(ticket, e),
        }
    }

    fn handle_fetch_failure(&mut self, ticket: Ticket, e: SyncError) {
        match e {
            SyncError::Auth(reason) => self.expire_session(&reason),
            other => {
                warn!(seq = ticket.seq, kind = ?ticket.kind, error = %other, "Refresh failed, keeping last known state");
                self.last_refresh_failed = true;
                if ticket.kind == RequestKind::List && self.state == SyncState::Syncing {
                    // 首次拉取失败也进入 Live，由周期刷新补偿
                    self.state = SyncState::Live;
                }
            }
        }
    }

    /// 列表请求异常终止（任务 panic），没有可用的票据
    ///
    /// 按暂时性失败处理，保证 `is_syncing` 不会一直为真。
    pub fn list_abandoned(&mut self) {
        if self.state == SyncState::Idle {
            return;
        }
        warn!(generation = self.generation, "List request aborted without a result");
        self.lists_in_flight = self.lists_in_flight.saturating_sub(1);
        self.last_refresh_failed = true;
        if self.state == SyncState::Syncing {
            self.state = SyncState::Live;
        }
    }

    /// 会话被服务端拒绝
    fn expire_session(&mut self, reason: &str) {
        warn!(reason = %reason, "Session rejected by server, re-authentication required");
        self.end_session();
        self.auth_required = true;
    }

    /// 处理推送的新通知
    ///
    /// 重复投递由 id 去重；只有首次出现的未读通知使计数加一。
    pub fn apply_push(&mut self, generation: u64, notification: Notification) {
        if generation != self.generation || self.state == SyncState::Idle {
            debug!(id = notification.id, "Discarding push from previous session");
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };

        let id = notification.id;
        if store.was_evicted(id) {
            debug!(id, "Ignoring push for already evicted notification");
            return;
        }
        let is_new = !store.contains(id);
        let unread = !notification.is_read;
        store.upsert(notification);
        if is_new && unread {
            store.increment_unread();
        }
        store.evict_overflow();
        debug!(id, is_new, unread_count = store.unread_count(), "Applied pushed notification");
    }

    /// 用户标记单条已读：本地立即生效，返回需要确认的票据
    pub fn mark_read(&mut self, id: NotificationId) -> Option<Ticket> {
        let changed = self.store.as_mut()?.mark_read(id);
        if changed {
            self.fence_count();
        }
        self.issue(RequestKind::MarkOne(id))
    }

    /// 用户全部标记已读
    pub fn mark_all_read(&mut self) -> Option<Ticket> {
        self.store.as_mut()?.mark_all_read();
        self.fence_count();
        self.issue(RequestKind::MarkAll)
    }

    /// 处理服务端确认结果
    ///
    /// 失败不回滚本地已读状态。
    pub fn apply_mutation(&mut self, ticket: Ticket, result: Result<(), SyncError>) {
        if !self.is_current(&ticket) {
            debug!(seq = ticket.seq, "Discarding stale mutation confirmation");
            return;
        }

        match result {
            Ok(()) => debug!(kind = ?ticket.kind, "Mutation confirmed"),
            Err(SyncError::NotFound(id)) => {
                debug!(id, "Server does not know notification, treating mark as done");
            }
            Err(SyncError::Auth(reason)) => self.expire_session(&reason),
            Err(e) => {
                self.failed_confirmations += 1;
                warn!(kind = ?ticket.kind, error = %e, "Server did not confirm mark-read, keeping local state");
            }
        }
    }

    /// 生成只读快照
    pub fn snapshot(&self) -> NotificationSnapshot {
        let (items, unread_count) = match &self.store {
            Some(store) => (store.items_newest_first(), store.unread_count()),
            None => (Vec::new(), 0),
        };

        NotificationSnapshot {
            state: self.state,
            items,
            unread_count,
            is_syncing: self.state == SyncState::Syncing || self.lists_in_flight > 0,
            last_refresh_failed: self.last_refresh_failed,
            auth_required: self.auth_required,
            failed_confirmations: self.failed_confirmations,
        }
    }
}
