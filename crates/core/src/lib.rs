pub mod config;
pub mod distributed;
pub mod engine;
pub mod kv_cache;
pub mod request;
pub mod sampling;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
