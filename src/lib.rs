pub mod config;
pub mod dashboard;
pub mod export;
pub mod record;
pub mod render;
pub mod sink;
pub mod source;
pub mod window;
