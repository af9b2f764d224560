//! 抓包监控模块
//!
//! 记录存储、抓包开关和变更通知，以及对外的查看接口

mod capture;
mod handlers;
mod router;
pub mod store;
pub mod types;

pub use capture::CaptureMonitor;
pub use router::{cors_layer, create_monitor_router};
