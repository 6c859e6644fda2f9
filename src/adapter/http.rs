//! 通知 REST API 客户端
//!
//! 对接后端 `/notifications` 路由：
//! - `GET  /notifications/`           列表（最新在前）
//! - `GET  /notifications/count`      `{"unread_count": n}`
//! - `PATCH /notifications/{id}/read` 标记单条已读
//! - `PATCH /notifications/read-all`  全部已读

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AuthContext, FetchAdapter, MutationAdapter, NotificationPage};
use crate::error::SyncError;
use crate::notification::{Completeness, Notification, NotificationId};

/// 默认 API 地址
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// 默认请求超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct CountResponse {
    unread_count: i64,
}

#[derive(Debug, Serialize)]
struct ReadUpdate {
    is_read: bool,
}

/// HTTP 通知 API
#[derive(Debug, Clone)]
pub struct HttpNotificationApi {
    client: Client,
    base_url: String,
    /// 单页上限，None 表示不分页（完整快照）
    page_size: Option<usize>,
    /// 只拉取未读
    unread_only: bool,
}

impl HttpNotificationApi {
    /// 创建客户端
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: None,
            unread_only: false,
        })
    }

    /// 设置单页上限
    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size.filter(|size| *size > 0);
        self
    }

    /// 只拉取未读通知（结果不再是完整快照）
    pub fn with_unread_only(mut self, unread_only: bool) -> Self {
        self.unread_only = unread_only;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/notifications{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        auth: &AuthContext,
        target: Option<NotificationId>,
    ) -> Result<Response, SyncError> {
        let response = request
            .bearer_auth(&auth.token)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("HTTP request failed: {}", e)))?;

        match classify_status(response.status(), target) {
            None => Ok(response),
            Some(err) => Err(err),
        }
    }
}

/// 按状态码归类错误，成功返回 None
pub fn classify_status(status: StatusCode, target: Option<NotificationId>) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }

    let err = match (status, target) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            SyncError::Auth(format!("server returned {}", status))
        }
        (StatusCode::NOT_FOUND, Some(id)) => SyncError::NotFound(id),
        _ => SyncError::Transient(format!("server returned {}", status)),
    };
    Some(err)
}

/// 校验原始列表并按页大小截断
///
/// 格式不合法的条目记录日志后丢弃。
pub fn build_page(raw: Vec<serde_json::Value>, page_size: Option<usize>) -> NotificationPage {
    let mut items: Vec<Notification> = raw
        .into_iter()
        .filter_map(|value| match Notification::from_value(value) {
            Ok(n) => Some(n),
            Err(reason) => {
                warn!(reason = %reason, "Dropping malformed notification from list response");
                None
            }
        })
        .collect();

    // id 是权威的新旧顺序
    items.sort_by(|a, b| b.id.cmp(&a.id));

    match page_size {
        Some(size) if items.len() >= size => {
            items.truncate(size);
            NotificationPage::partial(items)
        }
        _ => NotificationPage::complete(items),
    }
}

#[async_trait]
impl FetchAdapter for HttpNotificationApi {
    async fn list(&self, auth: &AuthContext) -> Result<NotificationPage, SyncError> {
        let mut request = self.client.get(self.url("/"));
        if self.unread_only {
            request = request.query(&[("unread_only", "true")]);
        }
        if let Some(size) = self.page_size {
            request = request.query(&[("limit", size)]);
        }

        let response = self.send(request, auth, None).await?;
        let raw: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| SyncError::Transient(format!("Failed to parse list response: {}", e)))?;

        debug!(received = raw.len(), "Fetched notification list");
        let mut page = build_page(raw, self.page_size);
        if self.unread_only {
            page.completeness = Completeness::Partial;
        }
        Ok(page)
    }

    async fn count(&self, auth: &AuthContext) -> Result<u64, SyncError> {
        let response = self.send(self.client.get(self.url("/count")), auth, None).await?;
        let body: CountResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Transient(format!("Failed to parse count response: {}", e)))?;

        Ok(body.unread_count.max(0) as u64)
    }
}

#[async_trait]
impl MutationAdapter for HttpNotificationApi {
    async fn mark_one(&self, auth: &AuthContext, id: NotificationId) -> Result<(), SyncError> {
        let request = self
            .client
            .patch(self.url(&format!("/{}/read", id)))
            .json(&ReadUpdate { is_read: true });

        self.send(request, auth, Some(id)).await?;
        debug!(id, "Server confirmed mark-one");
        Ok(())
    }

    async fn mark_all(&self, auth: &AuthContext) -> Result<(), SyncError> {
        self.send(self.client.patch(self.url("/read-all")), auth, None).await?;
        debug!("Server confirmed mark-all");
        Ok(())
    }
}
