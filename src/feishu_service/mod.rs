//! Feishu Drive service module
//!
//! Everything that talks to the Drive API lives here: the shared HTTP
//! client, the wire models, the error taxonomy, and the `RemoteDrive`
//! capability trait with its concrete Feishu implementation.

pub mod error;
pub mod feishu_client;
pub mod feishu_models;
pub mod http_client;

pub use error::RemoteError;
pub use feishu_client::{FeishuClient, RemoteDrive};
