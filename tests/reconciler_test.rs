//! Tests for the reconciler driving fetch, push and mutation flows

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, Notify};

use notify_sync::{
    AuthContext, FetchAdapter, LocalPushChannel, MutationAdapter, Notification, NotificationKind,
    NotificationPage, NotificationSnapshot, PushChannel, PushSubscription, Reconciler, ReconcilerClosed,
    ReconcilerSettings, RetryPolicy, SyncError, SyncState,
};

/// 可脚本化的 count 结果，带可选闸门
struct CountStep {
    result: Result<u64, SyncError>,
    gate: Option<Arc<Notify>>,
}

/// 手写的远程接口 mock
struct MockApi {
    page: Mutex<NotificationPage>,
    list_error: Mutex<Option<SyncError>>,
    list_panics: AtomicBool,
    counts: Mutex<VecDeque<CountStep>>,
    default_count: Mutex<u64>,
    mark_error: Mutex<Option<SyncError>>,
    list_calls: AtomicU32,
    count_calls: AtomicU32,
    mark_all_calls: AtomicU32,
    marked: Mutex<Vec<u64>>,
}

impl MockApi {
    fn new(items: Vec<Notification>) -> Self {
        let unread = items.iter().filter(|n| !n.is_read).count() as u64;
        Self {
            page: Mutex::new(NotificationPage::complete(items)),
            list_error: Mutex::new(None),
            list_panics: AtomicBool::new(false),
            counts: Mutex::new(VecDeque::new()),
            default_count: Mutex::new(unread),
            mark_error: Mutex::new(None),
            list_calls: AtomicU32::new(0),
            count_calls: AtomicU32::new(0),
            mark_all_calls: AtomicU32::new(0),
            marked: Mutex::new(Vec::new()),
        }
    }

    fn partial(self) -> Self {
        let items = self.page.lock().unwrap().items.clone();
        *self.page.lock().unwrap() = NotificationPage::partial(items);
        self
    }

    fn fail_list(&self, err: SyncError) {
        *self.list_error.lock().unwrap() = Some(err);
    }

    fn fail_marks(&self, err: SyncError) {
        *self.mark_error.lock().unwrap() = Some(err);
    }

    fn script_count(&self, result: Result<u64, SyncError>, gate: Option<Arc<Notify>>) {
        self.counts.lock().unwrap().push_back(CountStep { result, gate });
    }

    fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn count_calls(&self) -> u32 {
        self.count_calls.load(Ordering::SeqCst)
    }

    fn marked(&self) -> Vec<u64> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchAdapter for MockApi {
    async fn list(&self, _auth: &AuthContext) -> Result<NotificationPage, SyncError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_panics.load(Ordering::SeqCst) {
            panic!("list handler crashed");
        }
        if let Some(err) = self.list_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.page.lock().unwrap().clone())
    }

    async fn count(&self, _auth: &AuthContext) -> Result<u64, SyncError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.counts.lock().unwrap().pop_front();
        match step {
            Some(step) => {
                if let Some(gate) = step.gate {
                    gate.notified().await;
                }
                step.result
            }
            None => Ok(*self.default_count.lock().unwrap()),
        }
    }
}

#[async_trait]
impl MutationAdapter for MockApi {
    async fn mark_one(&self, _auth: &AuthContext, id: u64) -> Result<(), SyncError> {
        self.marked.lock().unwrap().push(id);
        match self.mark_error.lock().unwrap().clone() {
            Some(SyncError::NotFound(_)) => Err(SyncError::NotFound(id)),
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn mark_all(&self, _auth: &AuthContext) -> Result<(), SyncError> {
        self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
        match self.mark_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// 记录每次订阅使用的 token
struct RecordingPush {
    inner: LocalPushChannel,
    tokens: Mutex<Vec<String>>,
}

impl RecordingPush {
    fn new() -> Self {
        Self {
            inner: LocalPushChannel::new(),
            tokens: Mutex::new(Vec::new()),
        }
    }

    fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

impl PushChannel for RecordingPush {
    fn name(&self) -> &str {
        "recording"
    }

    fn subscribe(&self, auth: &AuthContext) -> PushSubscription {
        self.tokens.lock().unwrap().push(auth.token.clone());
        self.inner.subscribe(auth)
    }
}

fn unread(id: u64) -> Notification {
    Notification::new(id, NotificationKind::Quote, format!("quote {}", id))
}

fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        refresh_interval: Duration::from_secs(3600),
        full_refresh_every: 5,
        retention: 200,
        retry: RetryPolicy::none(),
    }
}

fn user(identity: &str) -> AuthContext {
    AuthContext::new(identity, format!("token-of-{}", identity))
}

async fn wait_for<F>(rx: &mut watch::Receiver<NotificationSnapshot>, pred: F) -> NotificationSnapshot
where
    F: Fn(&NotificationSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current = {
                let snapshot = rx.borrow_and_update();
                pred(&*snapshot).then(|| snapshot.clone())
            };
            if let Some(snapshot) = current {
                return snapshot;
            }
            rx.changed().await.expect("reconciler stopped");
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn push_line(n: serde_json::Value) -> String {
    json!({"type": "notification", "data": n}).to_string()
}

#[tokio::test]
async fn test_login_populates_store() {
    let api = Arc::new(MockApi::new(vec![unread(2), unread(1).with_read(true)]));
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    assert_eq!(handle.snapshot().state, SyncState::Idle);
    handle.login(user("alice")).await.unwrap();

    let snapshot = wait_for(&mut rx, |s| s.state == SyncState::Live && !s.is_syncing).await;
    assert_eq!(snapshot.items.len(), 2);
    assert_eq!(snapshot.items[0].id, 2);
    assert_eq!(snapshot.unread_count, 1);
    assert_eq!(api.list_calls(), 1);
}

#[tokio::test]
async fn test_older_count_cannot_overwrite_newer() {
    let api = Arc::new(MockApi::new(vec![unread(1), unread(2)]).partial());
    let gate = Arc::new(Notify::new());
    api.script_count(Ok(5), Some(gate.clone()));
    api.script_count(Ok(2), None);

    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_until(|| api.count_calls() == 1).await;

    handle.request_refresh().await.unwrap();
    wait_for(&mut rx, |s| s.unread_count == 2).await;

    // 先发起的请求最后完成
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.snapshot().unread_count, 2);
}

#[tokio::test]
async fn test_duplicate_push_counts_once() {
    // 分页结果不重算计数，unread_count == 1 说明 count 已生效
    let api = Arc::new(MockApi::new(vec![unread(1)]).partial());
    let push = Arc::new(LocalPushChannel::new());
    let (handle, _task) = Reconciler::spawn(
        api.clone(),
        api.clone(),
        Some(push.clone() as Arc<dyn PushChannel>),
        settings(),
    );
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    let before = wait_for(&mut rx, |s| s.state == SyncState::Live && s.unread_count == 1).await;
    wait_until(|| push.subscriber_count() == 1).await;

    let event = push_line(json!({"id": 3, "type": "request", "message": "New request", "created_at": "2024-05-01T10:00:00"}));
    push.publish(event.clone());
    push.publish(event);
    push.publish(push_line(json!({"id": 4, "type": "booking", "message": "Booked", "created_at": "2024-05-01T11:00:00"})));

    let snapshot = wait_for(&mut rx, |s| s.get(4).is_some()).await;
    assert_eq!(snapshot.items.iter().filter(|n| n.id == 3).count(), 1);
    assert_eq!(snapshot.unread_count, before.unread_count + 2);
}

#[tokio::test]
async fn test_malformed_push_is_dropped() {
    let api = Arc::new(MockApi::new(vec![]).partial());
    *api.default_count.lock().unwrap() = 3;
    let push = Arc::new(LocalPushChannel::new());
    let (handle, _task) = Reconciler::spawn(
        api.clone(),
        api.clone(),
        Some(push.clone() as Arc<dyn PushChannel>),
        settings(),
    );
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live && s.unread_count == 3).await;
    wait_until(|| push.subscriber_count() == 1).await;

    push.publish("{not json");
    push.publish(push_line(json!({"id": -1, "type": "request", "message": "bad"})));
    push.publish(push_line(json!({"id": 7, "type": "review", "message": "New review", "created_at": "2024-05-01T10:00:00"})));

    let snapshot = wait_for(&mut rx, |s| s.get(7).is_some()).await;
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.unread_count, 4);
}

#[tokio::test]
async fn test_mark_read_not_found_keeps_local_state() {
    let api = Arc::new(MockApi::new(vec![unread(99), unread(98)]));
    api.fail_marks(SyncError::NotFound(0));
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live && s.unread_count == 2).await;

    handle.mark_read(99).await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.get(99).is_some_and(|n| n.is_read)).await;
    assert_eq!(snapshot.unread_count, 1);

    wait_until(|| api.marked() == vec![99]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = handle.snapshot();
    assert!(snapshot.get(99).unwrap().is_read);
    assert_eq!(snapshot.unread_count, 1);
    assert_eq!(snapshot.failed_confirmations, 0);
    assert_eq!(snapshot.state, SyncState::Live);
}

#[tokio::test]
async fn test_failed_confirmation_does_not_roll_back() {
    let api = Arc::new(MockApi::new(vec![unread(1), unread(2)]));
    api.fail_marks(SyncError::Transient("server error 500".into()));
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live && s.unread_count == 2).await;

    handle.mark_all_read().await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.failed_confirmations == 1).await;
    assert_eq!(api.mark_all_calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshot.unread_count, 0);
    assert!(snapshot.items.iter().all(|n| n.is_read));
}

#[tokio::test]
async fn test_auth_failure_returns_to_idle() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    api.fail_list(SyncError::Auth("401".into()));
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.auth_required).await;
    assert_eq!(snapshot.state, SyncState::Idle);
    assert!(snapshot.items.is_empty());
    assert_eq!(snapshot.unread_count, 0);
}

#[tokio::test]
async fn test_transient_list_failure_keeps_going() {
    let api = Arc::new(MockApi::new(vec![]));
    api.fail_list(SyncError::Transient("connection refused".into()));
    api.script_count(Err(SyncError::Transient("connection refused".into())), None);
    *api.default_count.lock().unwrap() = 4;
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.state == SyncState::Live && s.last_refresh_failed).await;
    assert!(!snapshot.auth_required);
    assert!(snapshot.items.is_empty());

    // 下一次刷新恢复计数
    handle.request_refresh().await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.unread_count == 4).await;
    assert_eq!(snapshot.state, SyncState::Live);
}

#[tokio::test]
async fn test_logout_releases_resources() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    let push = Arc::new(LocalPushChannel::new());
    let (handle, _task) = Reconciler::spawn(
        api.clone(),
        api.clone(),
        Some(push.clone() as Arc<dyn PushChannel>),
        settings(),
    );
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live).await;
    wait_until(|| push.subscriber_count() == 1).await;

    handle.logout().await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.state == SyncState::Idle).await;
    assert!(snapshot.items.is_empty());
    wait_until(|| push.subscriber_count() == 0).await;

    // 登出后的推送不会进入存储
    push.publish(push_line(json!({"id": 5, "type": "request", "message": "late", "created_at": "2024-05-01T10:00:00"})));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.snapshot().items.is_empty());
}

#[tokio::test]
async fn test_switching_user_restarts_session() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live && s.unread_count == 1).await;

    // 同一身份重复登录只更新 token
    handle.login(AuthContext::new("alice", "rotated")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(api.list_calls(), 1);

    handle.login(user("bob")).await.unwrap();
    wait_until(|| api.list_calls() == 2).await;
    let snapshot = wait_for(&mut rx, |s| s.state == SyncState::Live && !s.is_syncing).await;
    assert_eq!(snapshot.items.len(), 1);
}

#[tokio::test]
async fn test_periodic_refresh() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    let settings = ReconcilerSettings {
        refresh_interval: Duration::from_millis(20),
        full_refresh_every: 2,
        ..settings()
    };
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings);
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live).await;

    // 每次刷新都拉计数，每两次拉一次列表
    wait_until(|| api.count_calls() >= 5 && api.list_calls() >= 2).await;
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let api = Arc::new(MockApi::new(vec![]));
    let (handle, task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert_eq!(handle.login(user("alice")).await, Err(ReconcilerClosed));
}

#[tokio::test]
async fn test_token_refresh_resubscribes_push() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    let push = Arc::new(RecordingPush::new());
    let (handle, _task) = Reconciler::spawn(
        api.clone(),
        api.clone(),
        Some(push.clone() as Arc<dyn PushChannel>),
        settings(),
    );
    let mut rx = handle.subscribe();

    handle.login(AuthContext::new("alice", "first")).await.unwrap();
    wait_for(&mut rx, |s| s.state == SyncState::Live).await;
    wait_until(|| push.tokens() == vec!["first".to_string()]).await;

    handle.login(AuthContext::new("alice", "second")).await.unwrap();
    wait_until(|| push.tokens() == vec!["first".to_string(), "second".to_string()]).await;
    // 旧订阅被释放
    wait_until(|| push.inner.subscriber_count() == 1).await;
    assert_eq!(api.list_calls(), 1);

    // token 不变时不重新订阅
    handle.login(AuthContext::new("alice", "second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(push.tokens().len(), 2);
}

#[tokio::test]
async fn test_panicking_list_does_not_leave_syncing() {
    let api = Arc::new(MockApi::new(vec![unread(1)]));
    api.list_panics.store(true, Ordering::SeqCst);
    api.script_count(Err(SyncError::Transient("connection refused".into())), None);
    let (handle, _task) = Reconciler::spawn(api.clone(), api.clone(), None, settings());
    let mut rx = handle.subscribe();

    handle.login(user("alice")).await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.state == SyncState::Live && !s.is_syncing).await;
    assert!(snapshot.last_refresh_failed);

    // 之后的刷新照常工作
    api.list_panics.store(false, Ordering::SeqCst);
    handle.request_refresh().await.unwrap();
    let snapshot = wait_for(&mut rx, |s| s.get(1).is_some() && !s.is_syncing).await;
    assert_eq!(snapshot.state, SyncState::Live);
}
