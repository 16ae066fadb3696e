//! 数据模型模块
//!
//! 该模块定义了连通性检查的核心数据模型：检查目标、探测日志、故障区间与派生条件，
//! 并提供序列化/反序列化功能。

pub mod status;
pub mod target;
