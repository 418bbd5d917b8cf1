pub mod config;
pub mod demo;
pub mod feed;
pub mod render;
