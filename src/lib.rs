pub mod config;
pub mod error;
pub mod link;
pub mod messages;
pub mod panel;
pub mod runtime;
pub mod schedule;
pub mod servo;
pub mod stage;
pub mod worker;
