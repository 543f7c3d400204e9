//! CLI command implementations.

pub mod account;
pub mod add;
pub mod delete;
pub mod init;
pub mod list;
pub mod status;
pub mod sync;
