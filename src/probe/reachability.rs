//! 可达性探测器实现
//!
//! 通过测试服务的WebSocket接口发送 `/_server test` 命令，
//! 按关联ID（corrId）匹配响应帧，判断中继服务器是否可达。

use crate::error::ProbeError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

/// 测试成功时响应的类型标识
pub const SERVER_TEST_RESULT: &str = "serverTestResult";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingSender = oneshot::Sender<Result<TestResult, ProbeError>>;

/// 可达性探测器trait
#[async_trait]
pub trait ReachabilityProber: Send + Sync {
    /// 测试单个端点
    ///
    /// # 返回
    /// * `Ok(bool)` - 测试服务给出的结论
    /// * `Err(ProbeError)` - 传输失败、超时或响应格式错误
    async fn test_endpoint(&self, uri: &str) -> Result<bool, ProbeError>;
}

/// 发送给测试服务的命令帧
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub corr_id: String,
    pub cmd: String,
}

impl CommandFrame {
    /// 构建服务器测试命令
    pub fn server_test(corr_id: impl Into<String>, uri: &str) -> Self {
        Self {
            corr_id: corr_id.into(),
            cmd: format!("/_server test 1 {}", uri.trim()),
        }
    }
}

/// 测试服务返回的测试结果
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub test_failure: Option<Value>,
}

impl TestResult {
    /// 类型为 `serverTestResult` 且没有失败信息时视为成功
    pub fn is_success(&self) -> bool {
        self.kind == SERVER_TEST_RESULT
            && matches!(self.test_failure, None | Some(Value::Null) | Some(Value::Bool(false)))
    }
}

/// 帧分发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// 已交付给等待中的请求
    Resolved(String),
    /// 无关联ID或关联ID不匹配，已忽略
    Ignored,
    /// 帧无法解析，所有等待中的请求均已失败
    Malformed,
}

/// 等待响应的请求表，以关联ID为键
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingSender>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个等待中的请求
    pub async fn register(
        &self,
        corr_id: &str,
    ) -> oneshot::Receiver<Result<TestResult, ProbeError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(corr_id.to_string(), tx);
        rx
    }

    /// 取消等待中的请求（超时或发送失败时）
    pub async fn cancel(&self, corr_id: &str) {
        self.inner.lock().await.remove(corr_id);
    }

    /// 等待中的请求数量
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 将一帧文本路由到对应的请求
    pub async fn dispatch(&self, text: &str) -> Dispatch {
        // 只有无法解析的文本才算协议错误，其余形状的帧都与等待中的请求无关
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("无法解析测试服务响应: {}", e);
                self.fail_all(|| ProbeError::Protocol(format!("无法解析响应: {e}")))
                    .await;
                return Dispatch::Malformed;
            }
        };

        let Some(corr_id) = frame.get("corrId").and_then(Value::as_str) else {
            debug!("忽略没有字符串corrId的事件帧");
            return Dispatch::Ignored;
        };

        let Some(tx) = self.inner.lock().await.remove(corr_id) else {
            debug!(corr_id = %corr_id, "忽略不匹配的响应帧");
            return Dispatch::Ignored;
        };

        let result = match frame.get("resp") {
            Some(resp) => TestResult::deserialize(resp)
                .map_err(|e| ProbeError::Protocol(format!("响应结构不符合预期: {e}"))),
            None => Err(ProbeError::Protocol("响应缺少resp字段".to_string())),
        };
        let _ = tx.send(result);
        Dispatch::Resolved(corr_id.to_string())
    }

    /// 以同一错误结束所有等待中的请求
    pub async fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> ProbeError,
    {
        let mut pending = self.inner.lock().await;
        for (corr_id, tx) in pending.drain() {
            debug!(corr_id = %corr_id, "结束等待中的测试请求");
            let _ = tx.send(Err(make_error()));
        }
    }
}

/// 与测试服务之间的一次WebSocket会话
///
/// 接收任务持续读取响应帧并通过 [`PendingRequests`] 分发，
/// 会话被丢弃时接收任务随之终止。
pub struct TestSession {
    sink: SplitSink<WsStream, Message>,
    pending: PendingRequests,
    recv_task: JoinHandle<()>,
    request_timeout: Duration,
}

impl TestSession {
    /// 连接测试服务并启动接收任务
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, ProbeError> {
        let (ws_stream, _) = tokio::time::timeout(request_timeout, connect_async(url))
            .await
            .map_err(|_| ProbeError::Timeout(request_timeout.as_millis() as u64))?
            .map_err(|e| ProbeError::Transport(format!("连接测试服务失败 {url}: {e}")))?;

        let (sink, stream) = ws_stream.split();
        let pending = PendingRequests::new();
        let recv_task = tokio::spawn(receiver_loop(stream, pending.clone()));

        Ok(Self {
            sink,
            pending,
            recv_task,
            request_timeout,
        })
    }

    /// 发送命令并等待关联ID匹配的响应
    pub async fn request(&mut self, frame: &CommandFrame) -> Result<TestResult, ProbeError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ProbeError::Protocol(format!("命令序列化失败: {e}")))?;

        let response_rx = self.pending.register(&frame.corr_id).await;

        if let Err(e) = self.sink.send(Message::Text(text)).await {
            self.pending.cancel(&frame.corr_id).await;
            return Err(ProbeError::Transport(format!("发送测试命令失败: {e}")));
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProbeError::Transport("响应通道已关闭".to_string())),
            Err(_) => {
                self.pending.cancel(&frame.corr_id).await;
                Err(ProbeError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }

    /// 关闭连接
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
        self.recv_task.abort();
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// 接收循环，在独立任务中运行
async fn receiver_loop(mut stream: SplitStream<WsStream>, pending: PendingRequests) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                pending.dispatch(&text).await;
            }
            Ok(Message::Binary(data)) => {
                pending.dispatch(&String::from_utf8_lossy(&data)).await;
            }
            Ok(Message::Close(frame)) => {
                debug!(frame = ?frame, "测试服务关闭了连接");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket错误: {}", e);
                break;
            }
        }
    }

    pending
        .fail_all(|| ProbeError::Transport("连接已关闭".to_string()))
        .await;
}

/// 基于WebSocket测试服务的可达性探测器
///
/// 每次测试建立独立连接，收到匹配响应或出错后关闭。
pub struct WsReachabilityProber {
    /// 测试服务地址
    harness_url: String,
    /// 连接与响应超时
    timeout: Duration,
}

impl WsReachabilityProber {
    /// 创建新的可达性探测器
    ///
    /// # 参数
    /// * `harness_url` - 测试服务的WebSocket地址
    /// * `timeout` - 连接和等待响应的超时时间
    pub fn new(harness_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            harness_url: harness_url.into(),
            timeout,
        }
    }

    fn next_corr_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[async_trait]
impl ReachabilityProber for WsReachabilityProber {
    async fn test_endpoint(&self, uri: &str) -> Result<bool, ProbeError> {
        let mut session = TestSession::connect(&self.harness_url, self.timeout).await?;

        let frame = CommandFrame::server_test(Self::next_corr_id(), uri);
        let result = session.request(&frame).await;
        session.close().await;

        let result = result?;
        debug!(uri = %uri.trim(), kind = %result.kind, "收到测试结果");
        Ok(result.is_success())
    }
}
