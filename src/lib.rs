//! kdscope - reconstructs a queryable model of machine execution history
//! from kdebug trace streams.
//!
//! The [`kdebug`] module decodes raw trace buffers, [`machine`] replays
//! them into CPU timelines, process and thread lifetimes, vouchers, kernel
//! messages and disk I/O, and [`summary`] answers windowed queries over the
//! finished model.

pub mod cli;
pub mod config;
pub mod error;
pub mod kdebug;
pub mod machine;
pub mod render;
pub mod summary;
pub mod time;
