//! The snapshot engine.
//!
//! - [`bitmap`] — per-group COW-bitmap cache with lazy materialization.
//! - [`cow`] — the COW and move-on-write decision/execution paths.
//! - [`read`] — snapshot-image read routing across the chain.
//! - [`ctl`] — lifecycle manager and the flag-driven control surface.
//! - [`hooks`] — journal access hooks the host filesystem calls before
//!   any metadata write, undo-write, or data overwrite/free.

pub mod bitmap;
pub mod cow;
pub mod ctl;
pub mod hooks;
pub mod read;
