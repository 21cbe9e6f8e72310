// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! A line-oriented echo server on the channel engine.
//!
//! ```sh
//! cargo run --example echo_server -- 127.0.0.1:7777
//! # then: nc 127.0.0.1 7777
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use keel_io::{
    Acceptor, Channel, ChannelEngine, ChannelFlags, ChannelHandler, DEFAULT_BACKLOG, IoVec, Listener, ReadOutcome,
    WriteVec,
};
use keel_mem::{Context, Pool};

/// Per-connection state: bytes read but not yet written back.
#[derive(Default)]
struct EchoConnection {
    buffered: Vec<u8>,
    inflight: Vec<u8>,
}

impl ChannelHandler for EchoConnection {
    fn on_read(&mut self, buf: Option<&[u8]>, channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<ReadOutcome> {
        match buf {
            Some(bytes) => {
                self.buffered.extend_from_slice(bytes);
                channel.desire_write();
                Ok(ReadOutcome::Consumed(bytes.len()))
            }
            None => Ok(ReadOutcome::Continue),
        }
    }

    fn on_write(&mut self, _channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<Option<WriteVec>> {
        // The previous vector has fully departed once we are asked again.
        self.inflight.clear();

        if self.buffered.is_empty() {
            return Ok(None);
        }
        self.inflight = std::mem::take(&mut self.buffered);

        let mut vec = WriteVec::new();
        vec.push(IoVec::new(&self.inflight));
        Ok(Some(vec))
    }
}

struct EchoAcceptor;

impl Acceptor for EchoAcceptor {
    fn accept(&mut self, _listener: Listener<'_>, channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<()> {
        eprintln!("accepted fd {}", channel.fd());
        channel.set_handler(Box::new(EchoConnection::default()));
        channel.desire_read();
        Ok(())
    }
}

fn main() -> keel_error::Result<()> {
    let address: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".to_owned())
        .parse()
        .expect("usage: echo_server [host:port]");

    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx)?;

    let listener = engine.listen(&address, DEFAULT_BACKLOG, ChannelFlags::default(), Box::new(EchoAcceptor))?;
    eprintln!("echoing on {}", keel_io::address_readable(&listener.local_address()?));

    loop {
        engine.run(Duration::from_secs(5))?;

        // Anything a connection handler could not report synchronously lands
        // on the context's unhandled list; surface it here.
        while let Some(err) = ctx.unhandled() {
            eprintln!("channel error: {err}");
            err.handled();
        }
    }
}
