use crate::task::RenderTask;

/// 队列生命周期事件
///
/// 事件在状态变更完成之后、在调用方的上下文中同步派发。
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { task: RenderTask },
    Started { task: RenderTask },
    Completed { task: RenderTask },
    Failed { task: RenderTask },
    Retry { task: RenderTask },
    Timeout { task: RenderTask },
    CleanedUp { tasks: Vec<RenderTask> },
    Paused,
    Resumed,
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "taskEnqueued",
            QueueEvent::Started { .. } => "taskStarted",
            QueueEvent::Completed { .. } => "taskCompleted",
            QueueEvent::Failed { .. } => "taskFailed",
            QueueEvent::Retry { .. } => "taskRetry",
            QueueEvent::Timeout { .. } => "taskTimeout",
            QueueEvent::CleanedUp { .. } => "tasksCleanedUp",
            QueueEvent::Paused => "queuePaused",
            QueueEvent::Resumed => "queueResumed",
        }
    }
}

/// 队列事件监听器
///
/// 回调必须快速返回；耗时工作应自行 spawn。
pub trait QueueEventListener: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}
