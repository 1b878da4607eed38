//! 账户服务库
//! 认证、令牌生命周期、欺诈评分、限流与会话/设备信任

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod store;
pub mod telemetry;
