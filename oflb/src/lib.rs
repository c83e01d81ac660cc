pub mod channel;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod session;
