//! 配置加载
//!
//! 读取优先级（后者覆盖前者）：
//! 1. 内置默认值
//! 2. 配置文件 `~/.config/notify-sync/config.json`
//! 3. 环境变量 `NOTIFY_SYNC_API_URL` / `NOTIFY_SYNC_TOKEN` / `NOTIFY_SYNC_PUSH_ADDR`
//! 4. 命令行参数（由调用方覆盖）

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::adapter::{AuthContext, RetryPolicy, DEFAULT_API_URL};
use crate::notification::DEFAULT_RETENTION;
use crate::push::PushConfig;
use crate::reconciler::ReconcilerSettings;

pub const ENV_API_URL: &str = "NOTIFY_SYNC_API_URL";
pub const ENV_TOKEN: &str = "NOTIFY_SYNC_TOKEN";
pub const ENV_PUSH_ADDR: &str = "NOTIFY_SYNC_PUSH_ADDR";

/// 同步配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// API 基础地址
    pub api_base_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// 会话身份，缺省时由 token 派生
    pub user_id: Option<String>,
    /// 单页上限，null 表示不分页
    pub page_size: Option<usize>,
    /// 存储保留上限
    pub retention_limit: usize,
    /// 周期刷新间隔（秒）
    pub refresh_interval_secs: u64,
    /// 每 N 次刷新做一次完整列表拉取
    pub full_refresh_every: u32,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub push: PushConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            token: None,
            user_id: None,
            page_size: Some(50),
            retention_limit: DEFAULT_RETENTION,
            refresh_interval_secs: 60,
            full_refresh_every: 5,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
            push: PushConfig::default(),
        }
    }
}

impl SyncConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("notify-sync")
            .join("config.json")
    }

    /// 从默认位置加载并应用环境变量
    pub fn auto_load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 从指定文件加载（不应用环境变量）
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// 应用环境变量覆盖
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_TOKEN).ok(),
            std::env::var(ENV_PUSH_ADDR).ok(),
        );
    }

    /// 覆盖地址、token、推送地址，空值忽略
    pub fn apply_overrides(
        &mut self,
        api_url: Option<String>,
        token: Option<String>,
        push_addr: Option<String>,
    ) {
        if let Some(url) = api_url.filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(token) = token.filter(|v| !v.trim().is_empty()) {
            self.token = Some(token);
        }
        if let Some(addr) = push_addr.filter(|v| !v.trim().is_empty()) {
            self.push.addr = Some(addr);
        }
    }

    /// 校验取值
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            bail!("api_base_url must not be empty");
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than 0");
        }
        if self.retention_limit == 0 {
            bail!("retention_limit must be greater than 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 构造会话上下文，缺少 token 时报错
    pub fn auth_context(&self) -> Result<AuthContext> {
        let Some(token) = self.token.clone() else {
            bail!("No token configured. Set {} or add \"token\" to {}", ENV_TOKEN, Self::default_path().display());
        };
        let identity = self
            .user_id
            .clone()
            .unwrap_or_else(|| derive_identity(&token));
        Ok(AuthContext::new(identity, token))
    }

    /// Reconciler 运行参数
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            full_refresh_every: self.full_refresh_every,
            retention: self.retention_limit,
            retry: self.retry.clone(),
        }
    }
}

/// 未配置 user_id 时用 token 末尾字符作为身份键
fn derive_identity(token: &str) -> String {
    let tail: String = token.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect();
    format!("token-{}", tail)
}
