//! 地理位置解析
//!
//! 将域名或IP地址解析为国家代码，匿名网络地址统一归为 `TOR`

use crate::endpoint::uri::{is_onion, TOR_COUNTRY};
use crate::error::GeoError;
use async_trait::async_trait;
use maxminddb::geoip2;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

/// IP到国家代码的查询接口
pub trait CountryLookup: Send + Sync {
    /// 查询IP所属国家，数据库中没有记录时返回 `Ok(None)`
    fn country(&self, ip: IpAddr) -> Result<Option<String>, GeoError>;
}

/// 基于MaxMind数据库的国家查询
pub struct MaxMindLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLookup {
    /// 打开MaxMind国家数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GeoError> {
        let reader = maxminddb::Reader::open_readfile(path.as_ref()).map_err(|e| {
            GeoError::Database(format!("无法打开 {}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self { reader })
    }
}

impl CountryLookup for MaxMindLookup {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, GeoError> {
        let record: Option<geoip2::Country> = self
            .reader
            .lookup(ip)
            .map_err(|e| GeoError::Database(e.to_string()))?;

        Ok(record
            .and_then(|record| record.country)
            .and_then(|country| country.iso_code)
            .map(str::to_string))
    }
}

/// 域名解析接口
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// 将域名解析为一个IP地址
    async fn resolve(&self, domain: &str) -> Result<IpAddr, GeoError>;
}

/// 使用系统解析器的域名解析
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<IpAddr, GeoError> {
        let mut addrs = tokio::net::lookup_host((domain, 0))
            .await
            .map_err(|e| GeoError::Dns {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| GeoError::Dns {
                domain: domain.to_string(),
                reason: "没有可用的IP地址".to_string(),
            })
    }
}

/// 国家解析接口
#[async_trait]
pub trait CountryResolver: Send + Sync {
    /// 将域名或IP字面量解析为国家代码
    async fn resolve_country(&self, domain: &str) -> Result<String, GeoError>;
}

/// 严格解析IPv4/IPv6字面量，支持带方括号的IPv6
fn parse_ip_literal(input: &str) -> Option<IpAddr> {
    if let Ok(v4) = input.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    let unbracketed = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(input);
    unbracketed.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

/// 地理位置解析器
pub struct GeoResolver {
    lookup: Arc<dyn CountryLookup>,
    dns: Arc<dyn HostResolver>,
}

impl GeoResolver {
    /// 使用系统DNS解析器创建
    pub fn new(lookup: Arc<dyn CountryLookup>) -> Self {
        Self::with_host_resolver(lookup, Arc::new(SystemResolver))
    }

    /// 使用自定义DNS解析器创建
    pub fn with_host_resolver(lookup: Arc<dyn CountryLookup>, dns: Arc<dyn HostResolver>) -> Self {
        Self { lookup, dns }
    }
}

#[async_trait]
impl CountryResolver for GeoResolver {
    async fn resolve_country(&self, domain: &str) -> Result<String, GeoError> {
        if is_onion(domain) {
            return Ok(TOR_COUNTRY.to_string());
        }

        let ip = match parse_ip_literal(domain) {
            Some(ip) => ip,
            None => self.dns.resolve(domain).await?,
        };

        self.lookup
            .country(ip)?
            .ok_or_else(|| GeoError::NotFound(ip.to_string()))
    }
}
