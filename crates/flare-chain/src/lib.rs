pub mod blocks;
pub mod morpho;
pub mod rpc;

pub use morpho::MorphoFetcher;
pub use rpc::{BlockTag, LogEntry, RpcClient};
