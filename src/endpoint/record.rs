//! 端点状态记录
//!
//! 定义端点的持久化记录、单次检测结果以及状态转换规则

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 端点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    /// 尚未检测
    Unknown,
    /// 可达
    Up,
    /// 不可达
    Down,
}

impl From<Option<bool>> for EndpointState {
    fn from(status: Option<bool>) -> Self {
        match status {
            None => EndpointState::Unknown,
            Some(true) => EndpointState::Up,
            Some(false) => EndpointState::Down,
        }
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointState::Unknown => write!(f, "未知"),
            EndpointState::Up => write!(f, "正常"),
            EndpointState::Down => write!(f, "异常"),
        }
    }
}

/// 端点持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    /// 端点URI（唯一键）
    pub uri: String,
    /// 最近一次检测的可达性，`None` 表示从未检测
    pub status: Option<bool>,
    /// 进入当前状态的时间
    pub status_since: Option<DateTime<Utc>>,
    /// 最近一次检测时间
    pub last_check: Option<DateTime<Utc>>,
    /// 国家代码
    pub country: Option<String>,
    /// 是否提供信息页面
    pub info_page_available: bool,
    /// 注册时间
    pub registered_at: DateTime<Utc>,
}

/// 单次检测流水线产生的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    /// 是否可达
    pub reachable: bool,
    /// 国家代码，解析失败时为空
    pub country: Option<String>,
    /// 是否提供信息页面
    pub info_page_available: bool,
}

/// 写入状态存储的更新补丁
///
/// 各字段的合并规则：
/// * `reachable` - 仅在与当前状态不同时写入 `status` 并重置 `status_since`
/// * `country` - 为 `Some` 时覆盖，为 `None` 时保留原值
/// * `info_page_available` - 每次都覆盖
///
/// `last_check` 每次更新都会写入。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub reachable: bool,
    pub country: Option<String>,
    pub info_page_available: bool,
}

impl From<&CheckOutcome> for StatusUpdate {
    fn from(outcome: &CheckOutcome) -> Self {
        Self {
            reachable: outcome.reachable,
            country: outcome.country.clone(),
            info_page_available: outcome.info_page_available,
        }
    }
}

/// 状态转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 状态未变化
    Unchanged(bool),
    /// 状态发生变化（包括从未知到已知）
    Changed { from: Option<bool>, to: bool },
}

impl Transition {
    /// 是否发生了状态变化
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// 存储更新结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 已写入
    Applied(Transition),
    /// 记录不存在，未做任何修改
    Missing,
}

impl EndpointRecord {
    /// 创建新注册的端点记录
    pub fn new(uri: impl Into<String>, registered_at: DateTime<Utc>) -> Self {
        Self {
            uri: uri.into(),
            status: None,
            status_since: None,
            last_check: None,
            country: None,
            info_page_available: false,
            registered_at,
        }
    }

    /// 当前状态
    pub fn state(&self) -> EndpointState {
        self.status.into()
    }

    /// 按合并规则应用一次检测结果
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Transition {
        self.last_check = Some(now);

        if let Some(country) = &update.country {
            self.country = Some(country.clone());
        }
        self.info_page_available = update.info_page_available;

        if self.status == Some(update.reachable) {
            return Transition::Unchanged(update.reachable);
        }

        let from = self.status;
        self.status = Some(update.reachable);
        self.status_since = Some(now);
        Transition::Changed {
            from,
            to: update.reachable,
        }
    }
}
