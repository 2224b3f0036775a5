use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::protocol::port_handler::PortHandler;

// The port's own timeout only paces the poll loop; the packet handler owns
// the real deadline.
const POLL_TIMEOUT: Duration = Duration::from_millis(2);

/// A real UART attached through the `serialport` crate.
pub struct SerialPortHandler {
    port: Box<dyn SerialPort>,
    baudrate: u32,
}

impl SerialPortHandler {
    pub fn open(port_name: &str, baudrate: u32) -> serialport::Result<SerialPortHandler> {
        let port = serialport::new(port_name, baudrate)
            .timeout(POLL_TIMEOUT)
            .open()?;
        log::debug!("opened serial port {port_name} at {baudrate} baud");
        Ok(SerialPortHandler { port, baudrate })
    }

    pub fn from_port(port: Box<dyn SerialPort>, baudrate: u32) -> SerialPortHandler {
        SerialPortHandler { port, baudrate }
    }

    pub fn set_baud_rate(&mut self, baudrate: u32) -> serialport::Result<()> {
        self.port.set_baud_rate(baudrate)?;
        self.baudrate = baudrate;
        log::debug!("serial port baud rate changed to {baudrate}");
        Ok(())
    }

    pub fn baud_rate(&self) -> u32 {
        self.baudrate
    }

    pub fn bytes_available(&mut self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }
}

impl PortHandler for SerialPortHandler {
    fn read_port(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    fn write_port(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let n = self.port.write(data)?;
        self.port.flush()?;
        Ok(n)
    }
}
