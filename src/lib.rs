pub mod catalog;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod events;
pub mod fs_util;
pub mod output;
pub mod pipeline;
pub mod place;
pub mod planner;
pub mod report;
pub mod store;
pub mod transfer;
pub mod unpack;
