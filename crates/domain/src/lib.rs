pub mod events;
pub mod task;

pub use events::{QueueEvent, QueueEventListener};
pub use task::{ChartConfig, QueueStatus, RenderTask, TaskState};
