//! # Vigil
//!
//! **Vigil** is a portable socket readiness layer for Rust, built as the
//! I/O notification primitive of the **Nebula** ecosystem.
//!
//! It exposes a single `epoll`-shaped interface on every supported platform:
//! register a descriptor with a set of [`Readiness`] flags and a 64-bit
//! token, then wait for reports carrying that token back.
//!
//! - **Linux**: a thin pass-through to native `epoll`
//! - **macOS**: an emulation on `kqueue`, including one-shot, edge-triggered
//!   and duplicate-registration semantics
//! - **Windows**: an emulation on the AFD driver's poll request and an I/O
//!   completion port
//!
//! Flags use the Linux `epoll` values everywhere, so raw bitmasks can be
//! passed around without translation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::net::TcpListener;
//! use std::os::fd::AsRawFd;
//! use vigil::{Poller, Readiness, Watch};
//!
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//! listener.set_nonblocking(true)?;
//!
//! let mut poller = Poller::new()?;
//! poller.add(listener.as_raw_fd(), Watch::new(Readiness::IN, 0))?;
//!
//! let mut events = [Watch::default(); 64];
//! loop {
//!     let n = poller.wait(&mut events, -1)?;
//!     for event in &events[..n] {
//!         if event.token == 0 {
//!             let (stream, _) = listener.accept()?;
//!             // ...
//!         }
//!     }
//! }
//! ```
//!
//! ## Getting Started
//!
//! Add Vigil to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! vigil = { git = "https://github.com/Nebula-ecosystem/Vigil", package = "vigil" }
//! ```

mod builder;
mod event;
mod poller;
mod utils;

pub use builder::PollerBuilder;
pub use event::{Readiness, Watch};
pub use poller::{Poller, RawFd};
