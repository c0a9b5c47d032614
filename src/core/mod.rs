pub mod config;
pub mod context;
pub mod effects;
pub mod error;
pub mod lifecycle;
pub mod shared;
pub mod urls;
