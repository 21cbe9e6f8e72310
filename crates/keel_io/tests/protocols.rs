// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Read/write protocol behavior over real descriptors: back-pressure,
//! vectored writes with partial resumption, and loop reentrancy.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use keel_error::code_values;
use keel_io::{Channel, ChannelEngine, ChannelHandler, IoVec, ReadOutcome, WriteVec};
use keel_mem::{Context, Pool};

/// Records every consumer invocation and answers from a script, defaulting to
/// consume-everything / stop-on-drain.
struct ScriptedReader {
    log: Rc<RefCell<Vec<Option<Vec<u8>>>>>,
    script: VecDeque<ReadOutcome>,
}

impl ScriptedReader {
    fn new(log: &Rc<RefCell<Vec<Option<Vec<u8>>>>>, script: impl IntoIterator<Item = ReadOutcome>) -> Box<Self> {
        Box::new(Self {
            log: Rc::clone(log),
            script: script.into_iter().collect(),
        })
    }
}

impl ChannelHandler for ScriptedReader {
    fn on_read(&mut self, buf: Option<&[u8]>, _channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<ReadOutcome> {
        self.log.borrow_mut().push(buf.map(<[u8]>::to_vec));

        Ok(self.script.pop_front().unwrap_or(match buf {
            Some(bytes) => ReadOutcome::Consumed(bytes.len()),
            None => ReadOutcome::Stop,
        }))
    }
}

#[test]
fn partial_consumption_exerts_back_pressure() {
    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (consumer_end, peer) = engine.pipe().expect("pipe");

    let log = Rc::new(RefCell::new(Vec::new()));
    consumer_end.set_handler(ScriptedReader::new(&log, [ReadOutcome::Consumed(5)]));

    peer.write(b"HELLOWORLD").expect("peer write");
    consumer_end.desire_read();
    engine.run(Duration::from_millis(500)).expect("run");

    {
        let calls = log.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].as_deref(), Some(&b"HELLOWORLD"[..]));
    }
    // Partial consumption turned reading off.
    assert!(!consumer_end.wants_read());

    // Without re-arming, further passes leave the consumer alone, even as
    // more data arrives.
    engine.run(Duration::from_millis(20)).expect("idle run");
    peer.write(b"XYZ").expect("peer write");
    engine.run(Duration::from_millis(20)).expect("idle run");
    assert_eq!(log.borrow().len(), 1);

    // Re-arm: the retained remainder is presented before any further OS read.
    consumer_end.desire_read();
    engine.run(Duration::from_millis(500)).expect("run");

    let calls = log.borrow();
    assert_eq!(calls[1].as_deref(), Some(&b"WORLD"[..]));
    assert_eq!(calls[2].as_deref(), Some(&b"XYZ"[..]));
    // The kernel drain ends with a would-block notification.
    assert_eq!(calls.last().expect("non-empty"), &None);
}

#[test]
fn eof_disarms_reading() {
    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (consumer_end, peer) = engine.pipe().expect("pipe");

    let log = Rc::new(RefCell::new(Vec::new()));
    consumer_end.set_handler(ScriptedReader::new(&log, []));

    peer.write(b"last words").expect("peer write");
    peer.close(false, true).expect("shut down the write side");

    consumer_end.desire_read();
    engine.run(Duration::from_millis(500)).expect("run");

    // The consumer saw the data; EOF then cleared the read desire without a
    // callback.
    assert_eq!(log.borrow()[0].as_deref(), Some(&b"last words"[..]));
    assert!(!consumer_end.wants_read());
}

/// Produces one two-element vector, then reports exhaustion.
struct TwoChunkWriter {
    first: Vec<u8>,
    second: Vec<u8>,
    calls: Rc<RefCell<usize>>,
    produced: bool,
}

impl ChannelHandler for TwoChunkWriter {
    fn on_write(&mut self, _channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<Option<WriteVec>> {
        *self.calls.borrow_mut() += 1;
        if self.produced {
            return Ok(None);
        }
        self.produced = true;

        let mut vec = WriteVec::new();
        vec.push(IoVec::new(&self.first));
        vec.push(IoVec::new(&self.second));
        Ok(Some(vec))
    }
}

#[test]
fn vectored_write_departs_fully_before_reinvoking_the_producer() {
    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (producer_end, peer) = engine.pipe().expect("pipe");

    let calls = Rc::new(RefCell::new(0));
    producer_end.set_handler(Box::new(TwoChunkWriter {
        first: b"AB".to_vec(),
        second: b"CDEF".to_vec(),
        calls: Rc::clone(&calls),
        produced: false,
    }));

    producer_end.desire_write();
    engine.run(Duration::from_millis(500)).expect("run");

    // The producer ran once for the vector and once more to report
    // exhaustion, which disarmed writing.
    assert_eq!(*calls.borrow(), 2);
    assert!(!producer_end.wants_write());

    let mut buf = [0_u8; 16];
    let n = peer.read(&mut buf).expect("peer read");
    assert_eq!(&buf[..n], b"ABCDEF");
}

#[test]
fn partial_vector_writes_resume_where_they_stopped() {
    const CHUNK: usize = 64 * 1024;

    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (producer_end, peer) = engine.pipe().expect("pipe");

    // A small kernel buffer forces the vector to depart in several partial
    // writes, exercising the mid-element resume path.
    producer_end.set_writebuf(4096).expect("shrink send buffer");

    let first: Vec<u8> = (0..CHUNK).map(|i| i as u8).collect();
    let second: Vec<u8> = (0..CHUNK).map(|i| (255 - i as u8)).collect();
    let mut expected = first.clone();
    expected.extend_from_slice(&second);

    let calls = Rc::new(RefCell::new(0));
    producer_end.set_handler(Box::new(TwoChunkWriter {
        first,
        second,
        calls: Rc::clone(&calls),
        produced: false,
    }));

    producer_end.desire_write();

    let mut received = Vec::with_capacity(2 * CHUNK);
    let mut spins = 0;
    while received.len() < 2 * CHUNK {
        spins += 1;
        assert!(spins < 10_000, "transfer stalled at {} bytes", received.len());

        engine.run(Duration::from_millis(20)).expect("run");

        let mut buf = [0_u8; 8192];
        let n = peer.read(&mut buf).expect("peer read");
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received, expected);
    // Exactly one vector and one exhaustion report: the producer was never
    // consulted mid-vector.
    assert_eq!(*calls.borrow(), 2);
}

/// Attempts to re-enter the loop from inside a consumer callback.
struct Reenter {
    observed: Rc<RefCell<Option<i32>>>,
}

impl ChannelHandler for Reenter {
    fn on_read(&mut self, buf: Option<&[u8]>, channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<ReadOutcome> {
        if let Some(bytes) = buf {
            let err = channel
                .engine()
                .run(Duration::from_millis(1))
                .expect_err("running the loop from a callback must be refused");
            *self.observed.borrow_mut() = Some(err.errval());
            err.handled();
            return Ok(ReadOutcome::Consumed(bytes.len()));
        }
        Ok(ReadOutcome::Stop)
    }
}

#[test]
fn reentering_the_loop_is_refused() {
    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (consumer_end, peer) = engine.pipe().expect("pipe");

    let observed = Rc::new(RefCell::new(None));
    consumer_end.set_handler(Box::new(Reenter {
        observed: Rc::clone(&observed),
    }));

    peer.write(b"poke").expect("peer write");
    consumer_end.desire_read();
    engine.run(Duration::from_millis(500)).expect("outer run succeeds");

    assert_eq!(*observed.borrow(), Some(code_values::IMPROPER_REENTRY));
}

/// A consumer error must not unwind through the loop; with unhandled tracking
/// on it lands on the context's post-mortem list.
struct Failing;

impl ChannelHandler for Failing {
    fn on_read(&mut self, _buf: Option<&[u8]>, channel: Channel<'_>, _scratch: Pool<'_>) -> keel_error::Result<ReadOutcome> {
        Err(keel_error::Error::with_message(
            channel.hub(),
            code_values::BAD_PARAM,
            "consumer rejected input",
        ))
    }
}

#[test]
fn callback_errors_are_absorbed_and_recorded() {
    let ctx = Context::new();
    let engine = ChannelEngine::new(&ctx).expect("engine");
    let (consumer_end, peer) = engine.pipe().expect("pipe");

    consumer_end.set_handler(Box::new(Failing));

    peer.write(b"boom").expect("peer write");
    consumer_end.desire_read();
    engine.run(Duration::from_millis(500)).expect("the loop itself is fine");

    // The error parked on the unhandled list, and the channel disarmed.
    let parked = ctx.unhandled().expect("error was recorded");
    assert_eq!(parked.errval(), code_values::BAD_PARAM);
    parked.handled();
    assert!(!consumer_end.wants_read());
}
