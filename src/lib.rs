//! loadcast — concurrent HTTP load generation with distributed coordination.
//!
//! The engine ([`engine::LoadEngine`]) runs a fixed request list for a number
//! of iterations under a concurrency cap, aggregating latency and throughput
//! live. The control channel ([`distribution`]) lets cooperating instances
//! exchange batch submissions over HTTP, so one operator can fan a batch out
//! across several generators. [`batch::BatchRunner`] ties the two together:
//! one engine run per requested concurrency level.

pub mod batch;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod payload;
pub mod results;
pub mod transport;
