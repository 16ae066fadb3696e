//! Conncheck Common - 跨模块共享的数据结构
//!
//! 该模块提供 Conncheck 项目中所有组件共享的数据结构与错误处理。
//! 包括检查目标、探测日志、故障区间等数据模型以及统一的错误类型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::status::*;
pub use models::target::*;
