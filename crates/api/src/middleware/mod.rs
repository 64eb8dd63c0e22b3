pub mod auth;
pub mod producer;
