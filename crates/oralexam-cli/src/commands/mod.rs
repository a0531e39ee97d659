pub mod init;
pub mod list_models;
pub mod session;
pub mod validate;
