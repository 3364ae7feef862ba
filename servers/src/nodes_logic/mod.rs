pub mod config;
pub mod downstream;
pub mod rest;
pub mod state;
