//! 事件发送模块
//!
//! 把连接监控产生的事件发布为关联到检查对象的 Kubernetes Event。

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder as EventRecorder, Reporter};
use kube::Client;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use conncheck_agent::recorder::Recorder;

const EVENT_ACTION: &str = "ConnectivityCheck";

/// 基于 kube 事件 API 的事件发送端
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Arc<EventRecorder>,
    object: String,
}

impl KubeEventSink {
    /// 创建关联到指定对象的事件发送端
    pub fn new(client: Client, reporter: Reporter, reference: ObjectReference) -> Self {
        let object = reference.name.clone().unwrap_or_default();
        Self {
            recorder: Arc::new(EventRecorder::new(client, reporter, reference)),
            object,
        }
    }

    fn publish(&self, type_: EventType, reason: &str, message: &str) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("没有可用的运行时，丢弃 {} 的事件 {}", self.object, reason);
                return;
            }
        };

        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: EVENT_ACTION.to_string(),
            secondary: None,
        };
        let recorder = self.recorder.clone();
        let object = self.object.clone();

        handle.spawn(async move {
            let reason = event.reason.clone();
            match recorder.publish(event).await {
                Ok(()) => debug!("已发布 {} 的事件 {}", object, reason),
                Err(e) => warn!("发布 {} 的事件 {} 失败: {}", object, reason, e),
            }
        });
    }
}

impl Recorder for KubeEventSink {
    fn event(&self, reason: &str, message: &str) {
        self.publish(EventType::Normal, reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.publish(EventType::Warning, reason, message);
    }
}
