//! Reconciler - 通知存储的唯一写者
//!
//! 单个任务串行处理所有输入：用户意图（登录/登出/刷新/已读）、在途请求的
//! 完成结果、推送事件和周期刷新。存储的每次变更在两次挂起点之间原子完成，
//! 展示层通过 `watch` 通道读取快照，读不阻塞写。
//!
//! # 使用示例
//! ```ignore
//! let api = Arc::new(HttpNotificationApi::new(url, timeout)?);
//! let (handle, task) = Reconciler::spawn(api.clone(), api, None, ReconcilerSettings::default());
//! handle.login(AuthContext::new("user-3", token)).await?;
//! let snapshot = handle.snapshot();
//! ```

pub mod snapshot;
pub mod sync_core;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::{AuthContext, FetchAdapter, MutationAdapter, NotificationPage, RetryPolicy};
use crate::error::SyncError;
use crate::notification::{Notification, NotificationId, DEFAULT_RETENTION};
use crate::push::{PushChannel, PushSubscription};

pub use sync_core::{RequestKind, SyncCore, Ticket};
pub use snapshot::{NotificationSnapshot, SyncState};

const COMMAND_BUFFER: usize = 64;

/// Reconciler 运行参数
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// 周期刷新间隔
    pub refresh_interval: Duration,
    /// 每 N 次刷新做一次完整列表拉取，0 表示只刷新计数
    pub full_refresh_every: u32,
    /// 存储保留上限
    pub retention: usize,
    /// 请求重试策略
    pub retry: RetryPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            full_refresh_every: 5,
            retention: DEFAULT_RETENTION,
            retry: RetryPolicy::default(),
        }
    }
}

/// Reconciler 已停止
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reconciler has shut down")]
pub struct ReconcilerClosed;

#[derive(Debug)]
enum Command {
    Login(AuthContext),
    Logout,
    Refresh,
    MarkRead(NotificationId),
    MarkAllRead,
    Shutdown,
}

enum Completion {
    List(Ticket, Result<NotificationPage, SyncError>),
    Count(Ticket, Result<u64, SyncError>),
    Mutation(Ticket, Result<(), SyncError>),
}

/// 展示层使用的句柄：读取快照、发出意图
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<NotificationSnapshot>,
}

impl ReconcilerHandle {
    async fn send(&self, command: Command) -> Result<(), ReconcilerClosed> {
        self.commands.send(command).await.map_err(|_| ReconcilerClosed)
    }

    /// 认证成功，开始（或切换）会话
    pub async fn login(&self, auth: AuthContext) -> Result<(), ReconcilerClosed> {
        self.send(Command::Login(auth)).await
    }

    /// 登出，丢弃存储
    pub async fn logout(&self) -> Result<(), ReconcilerClosed> {
        self.send(Command::Logout).await
    }

    /// 立即刷新列表和计数
    pub async fn request_refresh(&self) -> Result<(), ReconcilerClosed> {
        self.send(Command::Refresh).await
    }

    /// 标记单条已读（本地立即生效）
    pub async fn mark_read(&self, id: NotificationId) -> Result<(), ReconcilerClosed> {
        self.send(Command::MarkRead(id)).await
    }

    /// 全部标记已读（本地立即生效）
    pub async fn mark_all_read(&self) -> Result<(), ReconcilerClosed> {
        self.send(Command::MarkAllRead).await
    }

    /// 停止 Reconciler，释放所有资源
    pub async fn shutdown(&self) -> Result<(), ReconcilerClosed> {
        self.send(Command::Shutdown).await
    }

    /// 当前快照
    pub fn snapshot(&self) -> NotificationSnapshot {
        self.snapshots.borrow().clone()
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshots.clone()
    }
}

/// Reconciler
pub struct Reconciler {
    core: SyncCore,
    fetch: Arc<dyn FetchAdapter>,
    mutate: Arc<dyn MutationAdapter>,
    push: Option<Arc<dyn PushChannel>>,
    settings: ReconcilerSettings,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<NotificationSnapshot>,
    lists: JoinSet<Completion>,
    counts: JoinSet<Completion>,
    mutations: JoinSet<Completion>,
    /// 当前持有资源的会话代数
    active_generation: Option<u64>,
    refresh: Option<Interval>,
    ticks: u64,
    /// (订阅时的会话代数, 订阅)
    subscription: Option<(u64, PushSubscription)>,
}

impl Reconciler {
    /// 创建 Reconciler 及其句柄，需调用 [`Reconciler::run`]
    pub fn new(
        fetch: Arc<dyn FetchAdapter>,
        mutate: Arc<dyn MutationAdapter>,
        push: Option<Arc<dyn PushChannel>>,
        settings: ReconcilerSettings,
    ) -> (Self, ReconcilerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(NotificationSnapshot::idle());

        let reconciler = Self {
            core: SyncCore::new(settings.retention),
            fetch,
            mutate,
            push,
            settings,
            commands: command_rx,
            snapshots: snapshot_tx,
            lists: JoinSet::new(),
            counts: JoinSet::new(),
            mutations: JoinSet::new(),
            active_generation: None,
            refresh: None,
            ticks: 0,
            subscription: None,
        };
        let handle = ReconcilerHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        (reconciler, handle)
    }

    /// 创建并在后台任务中运行
    pub fn spawn(
        fetch: Arc<dyn FetchAdapter>,
        mutate: Arc<dyn MutationAdapter>,
        push: Option<Arc<dyn PushChannel>>,
        settings: ReconcilerSettings,
    ) -> (ReconcilerHandle, JoinHandle<()>) {
        let (reconciler, handle) = Self::new(fetch, mutate, push, settings);
        let task = tokio::spawn(reconciler.run());
        (handle, task)
    }

    /// 主循环，直到收到 Shutdown 或所有句柄被丢弃
    pub async fn run(mut self) {
        debug!("Reconciler started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(joined) = self.lists.join_next(), if !self.lists.is_empty() => {
                    self.handle_list_joined(joined);
                }
                Some(joined) = self.counts.join_next(), if !self.counts.is_empty() => {
                    self.handle_joined(joined);
                }
                Some(joined) = self.mutations.join_next(), if !self.mutations.is_empty() => {
                    self.handle_joined(joined);
                }
                (generation, pushed) = next_push(&mut self.subscription) => {
                    self.handle_push(generation, pushed);
                }
                _ = next_tick(&mut self.refresh) => self.on_tick(),
            }

            self.sync_resources();
            self.publish();
        }

        self.core.end_session();
        self.release_session_resources();
        self.publish();
        debug!("Reconciler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, "Handling command");
        match command {
            Command::Login(auth) => {
                let previous = self.core.generation();
                let previous_token = self.core.session().map(|s| s.token.clone());
                let tickets = self.core.begin_session(auth);
                if self.core.generation() != previous {
                    // 旧会话的资源要在新请求发出前释放
                    self.release_session_resources();
                } else if self.subscription.is_some()
                    && self.core.session().map(|s| &s.token) != previous_token.as_ref()
                {
                    // 推送连接仍带着旧 token
                    info!("Session token refreshed, resubscribing to push channel");
                    self.subscribe_push();
                }
                for ticket in tickets {
                    self.dispatch(ticket);
                }
            }
            Command::Logout => self.core.end_session(),
            Command::Refresh => {
                for ticket in self.core.refresh_tickets(true) {
                    self.dispatch(ticket);
                }
            }
            Command::MarkRead(id) => {
                if let Some(ticket) = self.core.mark_read(id) {
                    self.dispatch(ticket);
                }
            }
            Command::MarkAllRead => {
                if let Some(ticket) = self.core.mark_all_read() {
                    self.dispatch(ticket);
                }
            }
            Command::Shutdown => {}
        }
    }

    /// 为票据启动异步请求
    fn dispatch(&mut self, ticket: Ticket) {
        let Some(auth) = self.core.session().cloned() else {
            return;
        };
        let retry = self.settings.retry.clone();

        match ticket.kind {
            RequestKind::List => {
                let fetch = self.fetch.clone();
                self.lists.spawn(async move {
                    let result = retry.run("list", || fetch.list(&auth)).await;
                    Completion::List(ticket, result)
                });
            }
            RequestKind::Count => {
                let fetch = self.fetch.clone();
                self.counts.spawn(async move {
                    let result = retry.run("count", || fetch.count(&auth)).await;
                    Completion::Count(ticket, result)
                });
            }
            RequestKind::MarkOne(id) => {
                let mutate = self.mutate.clone();
                self.mutations.spawn(async move {
                    let result = retry.run("mark_one", || mutate.mark_one(&auth, id)).await;
                    Completion::Mutation(ticket, result)
                });
            }
            RequestKind::MarkAll => {
                let mutate = self.mutate.clone();
                self.mutations.spawn(async move {
                    let result = retry.run("mark_all", || mutate.mark_all(&auth)).await;
                    Completion::Mutation(ticket, result)
                });
            }
        }
    }

    fn handle_joined(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Ok(Completion::List(ticket, result)) => self.core.apply_list(ticket, result),
            Ok(Completion::Count(ticket, result)) => self.core.apply_count(ticket, result),
            Ok(Completion::Mutation(ticket, result)) => self.core.apply_mutation(ticket, result),
            Err(e) if e.is_cancelled() => debug!("In-flight request cancelled"),
            Err(e) => warn!(error = %e, "In-flight request panicked"),
        }
    }

    /// 列表任务异常结束时票据已丢失，交给核心按失败处理
    ///
    /// 会话切换时整个 JoinSet 被替换，这里只会收到当前会话的任务。
    fn handle_list_joined(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Err(e) if e.is_panic() => {
                warn!(error = %e, "List request panicked");
                self.core.list_abandoned();
            }
            other => self.handle_joined(other),
        }
    }

    fn handle_push(&mut self, generation: u64, pushed: Option<Notification>) {
        match pushed {
            Some(notification) => self.core.apply_push(generation, notification),
            None => {
                // 通道结束，下次刷新时重新订阅
                info!("Push subscription ended, will resubscribe on next refresh");
                self.subscription = None;
            }
        }
    }

    fn on_tick(&mut self) {
        self.ticks += 1;
        let every = u64::from(self.settings.full_refresh_every);
        let full = every > 0 && self.ticks % every == 0;
        debug!(tick = self.ticks, full, "Periodic refresh");

        for ticket in self.core.refresh_tickets(full) {
            self.dispatch(ticket);
        }
        if self.subscription.is_none() {
            self.subscribe_push();
        }
    }

    fn subscribe_push(&mut self) {
        let (Some(channel), Some(auth)) = (self.push.as_ref(), self.core.session()) else {
            return;
        };
        debug!(channel = channel.name(), "Subscribing to push channel");
        let subscription = channel.subscribe(auth);
        self.subscription = Some((self.core.generation(), subscription));
    }

    /// 让定时器、推送订阅与核心状态保持一致
    fn sync_resources(&mut self) {
        let state = self.core.state();
        let generation = self.core.generation();

        if state == SyncState::Idle {
            if self.active_generation.is_some() {
                self.release_session_resources();
            }
            return;
        }

        if self.active_generation != Some(generation) {
            self.refresh = None;
            self.active_generation = Some(generation);
            self.subscribe_push();
        }

        if state == SyncState::Live && self.refresh.is_none() {
            let period = self.settings.refresh_interval.max(Duration::from_millis(1));
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.refresh = Some(interval);
            self.ticks = 0;
        }
    }

    /// 释放会话资源：停止刷新、退订推送、取消在途读取
    ///
    /// 在途的已读确认不中止，但结果会因代数不匹配被丢弃。
    fn release_session_resources(&mut self) {
        if let Some(generation) = self.active_generation.take() {
            debug!(generation, "Releasing session resources");
        }
        self.refresh = None;
        self.subscription = None;
        // 丢弃旧的 JoinSet 会中止其中所有任务，结果不再被收取
        self.lists = JoinSet::new();
        self.counts = JoinSet::new();
        self.mutations.detach_all();
    }

    fn publish(&self) {
        let next = self.core.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_push(subscription: &mut Option<(u64, PushSubscription)>) -> (u64, Option<Notification>) {
    match subscription {
        Some((generation, sub)) => (*generation, sub.next().await),
        None => std::future::pending().await,
    }
}

async fn next_tick(refresh: &mut Option<Interval>) {
    match refresh {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
