// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Event-driven I/O for the Keel runtime.
//!
//! A [`ChannelEngine`] attaches to a [`Context`](keel_mem::Context) and
//! multiplexes non-blocking channels (TCP, UDP, pipes, Unix domain sockets)
//! through a readiness poller. Applications register a
//! [`ChannelHandler`] per channel, declare read/write interest, and drive the
//! loop one pass at a time:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use keel_io::{Channel, ChannelEngine, ChannelFlags, ChannelHandler, ReadOutcome};
//! use keel_mem::{Context, Pool};
//!
//! struct Printer;
//!
//! impl ChannelHandler for Printer {
//!     fn on_read(&mut self, buf: Option<&[u8]>, _channel: Channel<'_>, _scratch: Pool<'_>)
//!     -> keel_error::Result<ReadOutcome> {
//!         match buf {
//!             Some(bytes) => {
//!                 print!("{}", String::from_utf8_lossy(bytes));
//!                 Ok(ReadOutcome::Consumed(bytes.len()))
//!             }
//!             None => Ok(ReadOutcome::Continue),
//!         }
//!     }
//! }
//!
//! fn main() -> keel_error::Result<()> {
//!     let ctx = Context::new();
//!     let engine = ChannelEngine::new(&ctx)?;
//!
//!     let addrs = keel_io::address_lookup(ctx.hub(), "example.net", 80, keel_io::LookupFlags::empty())?;
//!     let channel = engine.tcp_connect(&addrs[0], None, ChannelFlags::default())?;
//!     channel.set_handler(Box::new(Printer));
//!     channel.desire_read();
//!
//!     loop {
//!         engine.run(Duration::from_secs(5))?;
//!     }
//! }
//! ```
//!
//! The read path applies **back-pressure**: a consumer that takes only part of
//! a buffer stops the engine from reading that channel until it re-arms, and
//! the remainder is re-presented first. The write path holds borrowed
//! [`IoVec`] descriptors and resumes partial writes mid-vector without copying
//! the producer's data.

mod addr;
mod channel;
mod engine;
mod listener;
mod pal;
mod write;

pub use addr::{LookupFlags, address_lookup, address_readable};
pub use channel::{Channel, ChannelFlags, ChannelHandler, IoVec, ReadOutcome, WriteVec};
pub use engine::{ChannelEngine, EngineRef, READ_BUFFER_DEFAULT};
pub use listener::{Acceptor, DEFAULT_BACKLOG, Listener};
