pub mod config;
pub mod geo;
pub mod roles;
pub mod time_window;
pub mod tz;
pub mod visit_contracts;
