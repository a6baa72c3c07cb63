//! Worker pools: a generic mutex+condvar thread pool, the network receive
//! pool with camera assignment, and the decode pool whose workers own a GPU
//! context each.

pub mod decode;
pub mod network;
pub mod thread_pool;

pub use decode::{DecodePool, DecodePoolConfig, DecodePoolStats};
pub use network::NetworkPool;
pub use thread_pool::{PoolStats, ThreadPool, ThreadPoolConfig};
