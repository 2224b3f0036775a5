pub mod codec;
pub mod dxl_def;
pub mod error;
pub mod handler;
pub mod instruction;
pub mod packet_logger;
pub mod port_handler;
pub mod serial_port;
pub mod status;
pub mod virtual_uart;
