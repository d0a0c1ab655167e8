//! Utilities for memory-efficient data structures.
//!
//! This module provides low-level utilities used internally by the pollers.
//! In particular, it exposes a [`Slab`] allocator used for fast indexed
//! storage with reuse of freed slots.

mod slab;

#[cfg_attr(not(windows), allow(unused_imports))]
pub(crate) use slab::Slab;
