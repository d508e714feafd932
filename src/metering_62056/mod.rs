use log::{debug, info};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use thiserror::Error;

pub mod utils;
pub mod structs;

use self::structs::{DeviceIdentification, Reading};
use self::utils::{ACK, ETX, NAK, SOH, STX};

const SIGN_ON_REQUEST: &[u8] = b"/?!\r\n";
const INITIAL_BAUD_RATE: u32 = 300;
/* Meter needs a moment after the option select before the line switches */
const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(300);
const MAX_LINE_LENGTH: usize = 128;
const MAX_BLOCK_LENGTH: usize = 4096;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Timeout waiting for the meter to respond")]
    Timeout,
    #[error("Serial I/O error: {0}")]
    Io(std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Block check character mismatch, expected {expected:#04x}, got {received:#04x}")]
    Bcc { expected: u8, received: u8 },
    #[error("Meter rejected the password")]
    AuthenticationRejected,
    #[error("Meter connection is not open")]
    NotConnected,
    #[error("Meter identification failed: {0}")]
    Identification(String),
}

impl From<std::io::Error> for MeterError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => MeterError::Timeout,
            _ => MeterError::Io(e),
        }
    }
}

impl MeterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeterError::Timeout)
    }
}

/// Session with a meter. All calls block for at most the configured timeout.
pub trait MeterTransport {
    /// Opens the underlying line, no traffic is exchanged yet.
    fn connect(&mut self) -> Result<(), MeterError>;
    /// Signs on and enters the password protected programming mode.
    fn authenticate(&mut self) -> Result<(), MeterError>;
    /// Reads a parameter, `additional_data` is passed as its argument.
    fn read_values(&mut self, address: &str, additional_data: Option<&str>) -> Result<Reading, MeterError>;
    /// Ends the programming session.
    fn end_session(&mut self) -> Result<(), MeterError>;
    /// Closes the underlying line.
    fn disconnect(&mut self) -> Result<(), MeterError>;
}

/// Byte stream to the meter's optical head. The baud rate changes once per
/// session, after the meter announced the rate it supports.
pub trait SerialLink: Read + Write + Send {
    fn set_baud_rate(&mut self, baud_rate: u32) -> std::io::Result<()>;
}

#[cfg(feature = "iec62056")]
impl SerialLink for Box<dyn serialport::SerialPort> {
    fn set_baud_rate(&mut self, baud_rate: u32) -> std::io::Result<()> {
        serialport::SerialPort::set_baud_rate(self.as_mut(), baud_rate).map_err(std::io::Error::from)
    }
}

#[cfg(feature = "iec62056")]
fn open_serial(path: &str, timeout: Duration) -> Result<Box<dyn SerialLink>, MeterError> {
    let mut port = serialport::new(path, INITIAL_BAUD_RATE)
        .data_bits(serialport::DataBits::Seven)
        .parity(serialport::Parity::Even)
        .stop_bits(serialport::StopBits::One)
        .timeout(timeout)
        .open()
        .map_err(|e| MeterError::Io(e.into()))?;

    // Optical heads are commonly powered from DTR/RTS
    port.write_data_terminal_ready(true).map_err(|e| MeterError::Io(e.into()))?;
    port.write_request_to_send(true).map_err(|e| MeterError::Io(e.into()))?;

    let link: Box<dyn SerialLink> = Box::new(port);
    Ok(link)
}

#[cfg(not(feature = "iec62056"))]
fn open_serial(path: &str, _timeout: Duration) -> Result<Box<dyn SerialLink>, MeterError> {
    Err(MeterError::Protocol(format!("serial support is not compiled in, cannot open {path}")))
}

/// IEC 62056-21 mode C client talking to Energomera meters.
pub struct Iec62056Client {
    port: String,
    password: String,
    timeout: Duration,
    link: Option<Box<dyn SerialLink>>,
    identification: Option<DeviceIdentification>,
}

impl Iec62056Client {
    pub fn new(port: &str, password: &str, timeout: Duration) -> Self {
        Self {
            port: port.to_string(),
            password: password.to_string(),
            timeout,
            link: None,
            identification: None,
        }
    }

    /// Client on top of an already opened link, `connect` becomes a no-op.
    pub fn with_link(password: &str, link: Box<dyn SerialLink>) -> Self {
        Self {
            port: String::new(),
            password: password.to_string(),
            timeout: Duration::ZERO,
            link: Some(link),
            identification: None,
        }
    }

    pub fn identification(&self) -> Option<&DeviceIdentification> {
        self.identification.as_ref()
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialLink>, MeterError> {
        self.link.as_mut().ok_or(MeterError::NotConnected)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), MeterError> {
        debug!("Sending to meter: {:?}", String::from_utf8_lossy(data));
        let link = self.link()?;
        link.write_all(data)?;
        link.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, MeterError> {
        let link = self.link()?;
        let mut buf = [0u8; 1];
        loop {
            match link.read(&mut buf) {
                Ok(0) => return Err(MeterError::Timeout),
                Ok(_) => return Ok(buf[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MeterError> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_byte()?;
            line.push(byte);
            if byte == b'\n' {
                break;
            }
            if line.len() > MAX_LINE_LENGTH {
                return Err(MeterError::Protocol("line from meter is too long".to_string()));
            }
        }
        Ok(String::from_utf8_lossy(&line).to_string())
    }

    /// Reads a `SOH/STX ... ETX BCC` block and returns what is between the
    /// start marker and ETX, after checking the BCC.
    fn read_block(&mut self) -> Result<Vec<u8>, MeterError> {
        let start = self.read_byte()?;
        if start == NAK {
            return Err(MeterError::Protocol("meter answered with NAK".to_string()));
        }
        if start != SOH && start != STX {
            return Err(MeterError::Protocol(format!("unexpected start of block {start:#04x}")));
        }

        let mut block = Vec::new();
        loop {
            let byte = self.read_byte()?;
            block.push(byte);
            if byte == ETX {
                break;
            }
            if block.len() > MAX_BLOCK_LENGTH {
                return Err(MeterError::Protocol("block from meter is too long".to_string()));
            }
        }

        let received = self.read_byte()?;
        let expected = utils::calculate_bcc(&block);
        if expected != received {
            return Err(MeterError::Bcc { expected, received });
        }

        debug!("Received from meter: {:?}", String::from_utf8_lossy(&block));
        block.pop();
        Ok(block)
    }
}

impl MeterTransport for Iec62056Client {
    fn connect(&mut self) -> Result<(), MeterError> {
        if self.link.is_some() {
            return Ok(());
        }
        info!("Opening {} for meter session", self.port);
        self.link = Some(open_serial(&self.port, self.timeout)?);
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), MeterError> {
        self.send(SIGN_ON_REQUEST)?;
        let line = self.read_line()?;
        let identification = utils::parse_identification_line(&line)?;

        // Option select: protocol 0, announced baud rate, programming mode
        let mut ack = vec![ACK, b'0'];
        ack.push(identification.baud_char as u8);
        ack.extend_from_slice(b"1\r\n");
        self.send(&ack)?;

        if let Some(rate) = utils::baud_rate_from_char(identification.baud_char) {
            if rate != INITIAL_BAUD_RATE {
                std::thread::sleep(BAUD_SWITCH_DELAY);
                debug!("Switching meter line to {rate} baud");
                self.link()?.set_baud_rate(rate)?;
            }
        }
        self.identification = Some(identification);

        // Password prompt, `P0` with the operand the meter wants echoed
        let prompt = self.read_block()?;
        if !prompt.starts_with(b"P0") {
            return Err(MeterError::Protocol(format!(
                "expected password prompt, got {:?}", String::from_utf8_lossy(&prompt)
            )));
        }

        let password = format!("({})", self.password);
        self.send(&utils::command_frame("P1", Some(&password)))?;
        match self.read_byte()? {
            ACK => Ok(()),
            NAK => Err(MeterError::AuthenticationRejected),
            other => Err(MeterError::Protocol(format!("unexpected answer to password {other:#04x}"))),
        }
    }

    fn read_values(&mut self, address: &str, additional_data: Option<&str>) -> Result<Reading, MeterError> {
        self.send(&utils::read_frame(address, additional_data))?;
        let block = self.read_block()?;
        // Strip the STX separating the header, if any
        let data = match block.iter().position(|b| *b == STX) {
            Some(pos) => &block[pos + 1..],
            None => &block[..],
        };
        utils::parse_data_sets(&String::from_utf8_lossy(data))
    }

    fn end_session(&mut self) -> Result<(), MeterError> {
        self.send(&utils::command_frame("B0", None))
    }

    fn disconnect(&mut self) -> Result<(), MeterError> {
        if self.link.take().is_none() {
            return Err(MeterError::NotConnected);
        }
        self.identification = None;
        debug!("Meter line closed");
        Ok(())
    }
}
