//! HTTP handlers

pub mod admin;
pub mod auth;
pub mod device;
pub mod health;
pub mod user;
