pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fields;
pub mod fs_util;
pub mod inventory;
pub mod manifest;
pub mod naming;
pub mod output;
pub mod participants;
pub mod planner;
pub mod resolver;
pub mod transfer;
pub mod tui;
pub mod validation;
