//! Medium Access Control (MAC) layer: slot scheduling, frame pooling, and
//! the TSCH link-layer engine.

pub mod pool;
pub mod scheduler;
pub mod tsch;


