//! # Utility Modules
//!
//! Supporting utilities for pooling, compression, logging and diagnostics.
//!
//! ## Components
//! - **Pool**: Generic object pool with explicit reset hooks
//! - **Buffer Pool**: Fixed-size byte buffers shared by every pipeline stage
//! - **Compression**: LZ4 and Zstd block compression strategy with size limits
//! - **Logging**: tracing-subscriber setup
//! - **Metrics**: Thread-safe observability counters
//! - **Text / Hexdump**: String sanitation and packet dumps for debug logs

pub mod buffer_pool;
pub mod compression;
pub mod hexdump;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod text;
