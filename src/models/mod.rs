//! 数据模型模块

pub mod auth;
pub mod fraud;
pub mod role;
pub mod security;
pub mod session;
pub mod user;
