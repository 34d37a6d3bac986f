pub mod api;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod housekeeping;
pub mod index;
pub mod live;
pub mod store;
