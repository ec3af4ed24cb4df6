pub use meta_db::MetaDb;
pub use worker_pool::{MultipleChannelWorkerPool, PoolHandler, WorkerPoolConfig};

mod meta_db;
mod worker_pool;
