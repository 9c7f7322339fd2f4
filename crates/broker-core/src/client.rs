use crate::buffer::NetworkBuffer;
use crate::error::{FatalReason, NetError, NetResult};

use slog::Logger;
use std::io::{self, Read, Write};

const INITIAL_BUFFER_CAPACITY: usize = 512;
const RX_CHUNK: usize = 4096;

/// Protocol state. Transitions are monotone: `New -> Connected -> Ready`, with
/// invalidation (slot removal) as the only other way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Connected,
    Ready,
}

/// A connected client socket plus everything the protocol state machine needs: buffers,
/// state, the ledger it joined, its streaming cursor into that ledger, and the two
/// timeout tick counters the reactor's timer event drives.
pub struct Client<S> {
    pub id: usize,
    pub socket: S,
    pub state: State,
    pub version: u32,
    pub ledger_id: Option<usize>,
    pub ledger_base: u32,
    pub op: u8,
    pub rx: NetworkBuffer,
    pub tx: NetworkBuffer,
    pub rx_timeout: u32,
    pub tx_timeout: u32,
    pub log: Logger,
}

impl<S: Read + Write> Client<S> {
    pub fn new(id: usize, socket: S, log: Logger) -> Client<S> {
        Client {
            id,
            socket,
            state: State::New,
            version: 0,
            ledger_id: None,
            ledger_base: 0,
            op: 0,
            rx: NetworkBuffer::new(INITIAL_BUFFER_CAPACITY),
            tx: NetworkBuffer::new(INITIAL_BUFFER_CAPACITY),
            rx_timeout: 0,
            tx_timeout: 0,
            log,
        }
    }

    /// Drains the socket into `rx`, growing it as needed. Stops normally on
    /// `WouldBlock` (resetting `rx_timeout`) or once `rx` can no longer grow
    /// (backpressure, in which case the caller retries on the next readable event).
    /// A zero-byte read is an orderly peer close and is fatal.
    pub fn flush_in(&mut self) -> NetResult<()> {
        loop {
            if !self.rx.reserve(RX_CHUNK.min(NetworkBuffer::MAX)) {
                return Ok(());
            }

            match self.socket.read(self.rx.writable_mut()) {
                Ok(0) => return Err(NetError::Fatal(FatalReason::PeerClosed)),
                Ok(n) => {
                    self.rx.commit(n);
                    self.rx_timeout = 0;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.rx_timeout = 0;
                    return Ok(());
                }
                Err(err) => return Err(NetError::from(err)),
            }
        }
    }

    /// Drains `tx`'s readable span to the socket. `WouldBlock` is swallowed by
    /// `NetworkBuffer::egress` itself; any other I/O error is fatal.
    pub fn flush_out(&mut self) -> NetResult<()> {
        match self.tx.egress(&mut self.socket) {
            Ok(_) => Ok(()),
            Err(err) => Err(NetError::from(err)),
        }
    }

    /// Ensures `n` bytes are available to peek/read, calling `flush_in` once if the
    /// buffer is currently short. Returns `NetError::Wait` (not fatal) if still short
    /// afterward; the caller should retry on the next readable event.
    fn ensure_readable(&mut self, n: usize) -> NetResult<()> {
        if self.rx.readable_len() < n {
            self.flush_in()?;
            if self.rx.readable_len() < n {
                return Err(NetError::Wait);
            }
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes from `rx` without advancing the read cursor.
    pub fn peek(&mut self, dst: &mut [u8]) -> NetResult<()> {
        self.ensure_readable(dst.len())?;
        dst.copy_from_slice(&self.rx.readable()[..dst.len()]);
        Ok(())
    }

    /// `peek` followed by `consume`.
    pub fn read(&mut self, dst: &mut [u8]) -> NetResult<()> {
        self.peek(dst)?;
        self.rx.consume(dst.len());
        Ok(())
    }

    /// Queues `bytes` for transmission and attempts to flush immediately. Fails fatally
    /// if `tx` has no room even at its hard cap.
    pub fn write(&mut self, bytes: &[u8]) -> NetResult<()> {
        if !self.tx.reserve(bytes.len()) {
            return Err(NetError::Fatal(FatalReason::BufferSaturated));
        }
        self.tx.writable_mut()[..bytes.len()].copy_from_slice(bytes);
        self.tx.commit(bytes.len());
        self.tx_timeout = 0;
        self.flush_out()
    }
}

/// Convenience used by the timer event: advances both timeout counters and reports
/// whether a keepalive should be enqueued and/or the client has timed out on rx.
pub struct TimerTick {
    pub send_keepalive: bool,
    pub rx_timed_out: bool,
}

impl<S: Read + Write> Client<S> {
    pub fn tick(&mut self) -> TimerTick {
        self.tx_timeout += 1;
        self.rx_timeout += 1;

        TimerTick {
            send_keepalive: self.state == State::Ready && self.tx_timeout > 3,
            rx_timed_out: self.rx_timeout > 30,
        }
    }
}
