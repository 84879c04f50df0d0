//! Token acquisition and persistence for the Drive API

pub mod feishu_auth;
pub mod token_store;

pub use feishu_auth::{FeishuAuth, TokenKind};
pub use token_store::{TokenFile, TokenStore};
