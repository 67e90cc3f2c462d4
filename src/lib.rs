pub mod bus;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod learning;
pub mod monitor;
pub mod registry;
pub mod safety;
pub mod state;
pub mod util;
pub mod workflow;
