//! 宿主侧服务
//!
//! - 命令分发表与模块注册时使用的宿主对象
//! - 本地化字符串
//! - 权限检查与面向操作者的管理入口

pub mod admin;
pub mod auth;
pub mod dispatch;
pub mod localization;
pub mod services;

pub use admin::ModuleAdmin;
pub use auth::{Authorizer, FileAuthorizer};
pub use dispatch::{
    handler_fn, CommandHandler, CommandRegistrar, CommandReply, CommandRequest, CommandTable,
};
pub use localization::Localization;
pub use services::{ConfigAccessor, HostServices, ModuleHost};
