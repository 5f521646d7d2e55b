#![no_std]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod error;
pub mod frame;
pub mod location;
pub mod log;
pub mod mac;
pub mod node;
pub mod radio_cap;
pub mod sixlo;
pub mod time;

pub use error::CoreError;
pub use node::{Node, NodeConfig, NodeStats};
