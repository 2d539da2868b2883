pub mod backend;
pub mod config;
pub mod controller;
pub mod health;
pub mod protocol;
pub mod reader;
pub mod state;
pub mod utils;
