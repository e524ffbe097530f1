//! 信息页面探测器实现
//!
//! 请求端点域名下的网页，检查响应体中是否包含产品标识

use crate::endpoint::uri::ONION_SUFFIX;
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::debug;

/// 信息页面探测器trait
#[async_trait]
pub trait InfoPageProber: Send + Sync {
    /// 检测域名是否提供信息页面，任何错误均视为不提供
    async fn has_info_page(&self, domain: &str) -> bool;
}

/// 基于HTTP GET的信息页面探测器
pub struct HttpInfoPageProber {
    /// HTTP客户端
    client: Client,
    /// 经由Tor SOCKS5代理的客户端，仅用于onion域名
    tor_client: Option<Client>,
    /// 页面标识字符串（小写）
    marker: String,
    /// 请求协议，默认为https
    scheme: String,
}

impl HttpInfoPageProber {
    /// 创建新的信息页面探测器
    ///
    /// # 参数
    /// * `timeout` - 请求超时时间
    /// * `marker` - 页面中需要包含的标识字符串（不区分大小写）
    /// * `tor_socks5_proxy` - 可选的Tor SOCKS5代理地址
    pub fn new(
        timeout: Duration,
        marker: &str,
        tor_socks5_proxy: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}/{}", crate::APP_NAME, crate::VERSION))
            .build()?;

        let tor_client = match tor_socks5_proxy {
            Some(proxy_url) => Some(
                Client::builder()
                    .timeout(timeout)
                    .proxy(Proxy::all(proxy_url)?)
                    .build()?,
            ),
            None => None,
        };

        Ok(Self {
            client,
            tor_client,
            marker: marker.to_lowercase(),
            scheme: "https".to_string(),
        })
    }

    /// 修改请求协议
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// 选择客户端并构建页面地址
    fn target(&self, domain: &str) -> (&Client, String) {
        match &self.tor_client {
            Some(tor_client) if domain.ends_with(ONION_SUFFIX) => {
                (tor_client, format!("http://{domain}/"))
            }
            _ => (&self.client, format!("{}://{}/", self.scheme, domain)),
        }
    }

    /// 判断响应体是否包含标识
    fn body_has_marker(&self, body: &str) -> bool {
        !body.is_empty() && body.to_lowercase().contains(&self.marker)
    }

    async fn fetch(&self, domain: &str) -> Result<bool, reqwest::Error> {
        let (client, url) = self.target(domain);
        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            debug!(url = %url, status = response.status().as_u16(), "信息页面返回非2xx状态");
            return Ok(false);
        }

        let body = response.text().await?;
        Ok(self.body_has_marker(&body))
    }

    /// 格式化请求错误信息
    fn format_request_error(error: &reqwest::Error) -> String {
        if error.is_timeout() {
            "Request timeout".to_string()
        } else if error.is_connect() {
            "Connection refused".to_string()
        } else if error.is_decode() {
            "Response decode error".to_string()
        } else {
            format!("Request failed: {error}")
        }
    }
}

#[async_trait]
impl InfoPageProber for HttpInfoPageProber {
    async fn has_info_page(&self, domain: &str) -> bool {
        match self.fetch(domain).await {
            Ok(available) => available,
            Err(e) => {
                debug!(domain = %domain, "信息页面请求失败: {}", Self::format_request_error(&e));
                false
            }
        }
    }
}
