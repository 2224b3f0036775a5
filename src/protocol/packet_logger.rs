use std::io;

use crate::protocol::port_handler::PortHandler;

/// Wraps any port and mirrors the traffic to the `log` facade.
///
/// Reads are only logged when they return data, so the handler's polling
/// does not flood the log. Enable with `RUST_LOG=dxl_bus=trace` under any
/// `log` backend.
#[derive(Debug)]
pub struct PacketLogger<P> {
    inner: P,
}

impl<P: PortHandler> PacketLogger<P> {
    pub fn new(inner: P) -> PacketLogger<P> {
        PacketLogger { inner }
    }

    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: PortHandler> PortHandler for PacketLogger<P> {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_port(buf)?;
        if n > 0 {
            log::trace!("read {n} bytes [{}]", hex_dump(&buf[..n]));
        }
        Ok(n)
    }

    fn write_port(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write_port(data)?;
        log::trace!("wrote {n} bytes [{}]", hex_dump(&data[..n]));
        Ok(n)
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join("|")
}
