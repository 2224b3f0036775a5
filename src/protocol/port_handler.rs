use std::collections::VecDeque;
use std::io;
use std::time::Instant;

use crate::sim::DxlBusSim;

/// The byte duplex a packet handler drives.
///
/// Reads are non-blocking in spirit: returning `Ok(0)` means "no data yet",
/// never end-of-stream. The handler owns all waiting and deadline logic.
pub trait PortHandler {
    /// Read up to `buf.len()` bytes, returning how many were filled.
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write bytes from `data`, returning how many were accepted.
    fn write_port(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Port backed by the simulated bus. Replies are released on a schedule so
/// device-side delays (initial silence, mid-packet stalls) behave like a
/// real half-duplex line without any threads.
#[derive(Debug)]
pub struct SimPort {
    bus: DxlBusSim,
    rx: VecDeque<(Instant, Vec<u8>)>,
    pending: Vec<u8>,
}

impl SimPort {
    pub fn new(bus: DxlBusSim) -> SimPort {
        SimPort {
            bus,
            rx: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    pub fn bus_mut(&mut self) -> &mut DxlBusSim {
        &mut self.bus
    }

    fn promote_due(&mut self) {
        let now = Instant::now();
        while self.rx.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, bytes)) = self.rx.pop_front() {
                self.pending.extend_from_slice(&bytes);
            }
        }
    }
}

impl PortHandler for SimPort {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.promote_due();
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_port(&mut self, data: &[u8]) -> io::Result<usize> {
        let now = Instant::now();
        for chunk in self.bus.handle_frame(data) {
            self.rx.push_back((now + chunk.delay, chunk.bytes));
        }
        Ok(data.len())
    }
}
