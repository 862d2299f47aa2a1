//! CLI Commands

pub mod admin;
pub mod node;
pub mod request;
