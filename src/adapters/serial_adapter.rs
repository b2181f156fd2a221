use super::{take_complete_lines, Adapter};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Line-oriented link to a USB-serial instrument.
///
/// Port I/O is synchronous, so every read and write runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SerialAdapter {
    port_name: String,
    baud_rate: u32,

    /// Internal read timeout of the port
    timeout: Duration,

    /// Line terminator appended to commands (e.g., "\r\n")
    line_terminator: String,

    /// Software (XON/XOFF) flow control, required by the CAEN supplies
    xon_xoff: bool,

    /// Received bytes not yet terminated by a newline
    pending: String,

    /// Open port, shared with the blocking tasks
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Unopened adapter for `port_name` (`/dev/ttyACM0`, `COM4`) at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(100),
            line_terminator: "\n".to_string(),
            xon_xoff: false,
            pending: String::new(),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Use `terminator` after every written command.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Enable XON/XOFF software flow control.
    pub fn with_xon_xoff(mut self, enabled: bool) -> Self {
        self.xon_xoff = enabled;
        self
    }

    /// Port this adapter talks to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the port. Pending input is discarded.
    pub fn open(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let flow = if self.xon_xoff {
                serialport::FlowControl::Software
            } else {
                serialport::FlowControl::None
            };
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.timeout)
                .flow_control(flow)
                .open()
                .map_err(|e| {
                    LabError::Instrument(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;
            port.clear(serialport::ClearBuffer::Input)
                .map_err(|e| LabError::Instrument(format!("Failed to clear '{}': {}", self.port_name, e)))?;

            self.port = Some(Arc::new(Mutex::new(port)));
            self.pending.clear();

            debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(LabError::SerialFeatureDisabled)
        }
    }

    /// Close the port if open.
    pub fn close(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "serial port closed");
            }
        }
    }
}

#[async_trait]
impl Adapter for SerialAdapter {
    async fn write_line(&mut self, line: &str) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or(LabError::SerialPortNotConnected)?
                .clone();
            let command = format!("{}{}", line, self.line_terminator);
            let port_name = self.port_name.clone();

            // Blocking port I/O
            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.write_all(command.as_bytes())?;
                port_guard.flush()?;
                debug!(port = %port_name, command = %command.trim(), "sent serial command");
                Ok(())
            })
            .await
            .map_err(|e| LabError::Instrument(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = line;
            Err(LabError::SerialFeatureDisabled)
        }
    }

    async fn read_lines(&mut self) -> AppResult<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self
                .port
                .as_ref()
                .ok_or(LabError::SerialPortNotConnected)?
                .clone();

            let bytes = tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let available = port_guard
                    .bytes_to_read()
                    .map_err(|e| LabError::Instrument(format!("Serial status error: {}", e)))?
                    as usize;
                if available == 0 {
                    return Ok(Vec::new());
                }
                let mut buffer = vec![0u8; available];
                let read = port_guard.read(&mut buffer)?;
                buffer.truncate(read);
                Ok(buffer)
            })
            .await
            .map_err(|e| LabError::Instrument(format!("Serial I/O task panicked: {}", e)))??;

            self.pending.push_str(&String::from_utf8_lossy(&bytes));
            Ok(take_complete_lines(&mut self.pending))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(LabError::SerialFeatureDisabled)
        }
    }
}
