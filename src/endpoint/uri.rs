//! 中继服务器URI解析
//!
//! 从端点URI中提取协议类型和可解析的域名，并识别官方运营的服务器

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 匿名网络地址后缀
pub const ONION_SUFFIX: &str = ".onion";

/// 官方服务器保留域名
pub const DEFAULT_OFFICIAL_MARKER: &str = "simplex.im";

/// 匿名网络端点使用的伪国家代码
pub const TOR_COUNTRY: &str = "TOR";

/// 中继服务器协议类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    /// 消息中继
    Smp,
    /// 文件中继
    Xftp,
    /// 其他未识别的协议前缀
    Other(String),
}

impl ServerProtocol {
    fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "smp" => ServerProtocol::Smp,
            "xftp" => ServerProtocol::Xftp,
            other => ServerProtocol::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerProtocol::Smp => write!(f, "smp"),
            ServerProtocol::Xftp => write!(f, "xftp"),
            ServerProtocol::Other(scheme) => write!(f, "{scheme}"),
        }
    }
}

/// URI解析结果，不持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    /// 协议类型（第一个 `:` 之前的前缀）
    pub protocol: ServerProtocol,
    /// 可解析的域名
    pub domain: Option<String>,
}

fn domain_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}").ok()
        })
        .as_ref()
}

/// 提取字符串中第一个形如域名的子串
fn extract_domain(input: &str) -> Option<String> {
    domain_pattern()?.find(input).map(|m| m.as_str().to_string())
}

/// 判断URI是否为匿名网络地址
pub fn is_onion(uri: &str) -> bool {
    uri.trim_end().ends_with(ONION_SUFFIX)
}

/// 解析端点URI
///
/// 单一主机的onion地址没有可解析的域名；包含逗号的onion地址
/// （同时列出了普通主机）取第一个域名形式的片段。
pub fn classify(uri: &str) -> ParsedUri {
    let scheme = uri.split(':').next().unwrap_or_default();
    let protocol = ServerProtocol::from_scheme(scheme);

    let domain = if is_onion(uri) && !uri.contains(',') {
        None
    } else {
        extract_domain(uri)
    };

    ParsedUri { protocol, domain }
}

/// 判断URI是否为官方运营的服务器
pub fn is_official(uri: &str) -> bool {
    is_official_with_marker(uri, DEFAULT_OFFICIAL_MARKER)
}

/// 使用自定义保留域名判断URI是否为官方服务器
pub fn is_official_with_marker(uri: &str, marker: &str) -> bool {
    uri.contains(marker)
}
