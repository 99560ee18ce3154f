//! Forgepool - mining pool core
//!
//! This crate implements the network-facing heart of a scrypt-variant
//! mining pool: a dual-dialect stratum engine (line-JSON v1 and encrypted
//! binary v2 on a single listener), per-connection session state with
//! variable difficulty, and a batched share-validation pipeline that
//! computes per-miner credit. Durable storage and the upstream node are
//! collaborators behind narrow traits, not parts of this crate.
//!
//! ## Architecture
//!
//! 1. `server` - listener, per-IP accept limits, protocol detection
//! 2. `session` - connection drivers and shared per-session state
//! 3. `stratum` - the two wire dialects (v1 lines, v2 frames + noise)
//! 4. `template` / `job` - upstream templates, job binding and fan-out
//! 5. `validation` / `hashing` - header rebuild and the scrypt-variant PoW
//! 6. `batch` - bounded-queue worker pool, statistics, storage boundary
//! 7. `vardiff` - per-miner difficulty control
//!
//! ## Design principles
//!
//! 1. **Classification, not exceptions**: share rejects are values that are
//!    counted and replied, never unwinding errors
//! 2. **Bounded everywhere**: every queue between the socket and storage is
//!    bounded; overload drops the lowest-value work instead of blocking
//! 3. **At-most-once accounting**: a share tuple is counted once per
//!    session, enforced at validation and again at the storage boundary

// Memory allocator optimization using mimalloc (faster than default allocator)
// Disabled for Windows cross-compilation (mimalloc linking issues with MinGW)
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod batch;
pub mod config;
pub mod hashing;
pub mod job;
pub mod server;
pub mod session;
pub mod stratum;
pub mod template;
pub mod utils;
pub mod validation;
pub mod vardiff;

// Re-export the types a consumer embedding the pool core needs most.
pub use batch::repository::{MemoryRepository, ShareRepository};
pub use batch::{BatchProcessor, BatchStatistics};
pub use config::PoolConfig;
pub use hashing::{HashEngine, ScryptParams, ScryptVariant};
pub use server::{PoolContext, PoolServer};
pub use template::{BlockTemplate, TemplateProvider, TemplateStore};
pub use validation::{Classification, Share, ShareValidator};
pub use vardiff::VardiffController;
