//! CAEN R1419ET high-voltage power supply.
//!
//! ## Protocol
//!
//! Commands are ASCII lines of the form
//!
//! ```text
//! $BD:00,CMD:SET,CH:1,PAR:VSET,VAL:1500.00
//! $BD:00,CMD:MON,PAR:BDSNUM
//! ```
//!
//! and every command is answered with one line:
//!
//! ```text
//! #BD:00,CMD:OK
//! #BD:00,CMD:OK,VAL:1234
//! #BD:00,VAL:ERR
//! ```
//!
//! The supply requires XON/XOFF flow control. Only board 0 is addressed.
//! Channel 4 addresses all four channels at once.

use super::OutputDriver;
use crate::adapters::Adapter;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

/// Baud rate of the R1419ET USB interface.
pub const BAUD_RATE: u32 = 9600;

/// Channel number that addresses every channel.
pub const ALL_CHANNELS: u8 = 4;

const RESPONSE_PATTERN: &str = r"^#BD:\d{2},\w{2,3}:\w{2,3}(,VAL:(\S|(\w+\.*\w+;?){1,4}))?$";

/// Decoded answer from the supply.
#[derive(Debug, Clone, PartialEq)]
pub enum CaenReply {
    /// Command accepted without a value
    Ok,
    /// Command accepted, with the returned `;`-separated values
    Values(Vec<String>),
    /// Command refused; holds the offending field (`CMD`, `CH`, `PAR`, `VAL`)
    Error(String),
}

/// One channel of an R1419ET driven by its `VSET` parameter.
pub struct CaenR1419 {
    name: String,
    channel: u8,
    adapter: Box<dyn Adapter>,
    response_pattern: Regex,
}

impl CaenR1419 {
    /// Drive `channel` (0-3) of board 0 through `adapter`.
    pub fn new(name: impl Into<String>, channel: u8, adapter: Box<dyn Adapter>) -> AppResult<Self> {
        if channel >= ALL_CHANNELS {
            return Err(LabError::Configuration(format!(
                "CAEN R1419 channel must be 0-3, got {}",
                channel
            )));
        }
        let response_pattern = Regex::new(RESPONSE_PATTERN)
            .map_err(|e| LabError::Instrument(format!("invalid CAEN response pattern: {}", e)))?;
        Ok(Self {
            name: name.into(),
            channel,
            adapter,
            response_pattern,
        })
    }

    /// Query the board serial number to check the link. Logs the answer.
    pub async fn identify(&mut self) -> AppResult<()> {
        self.send(&Self::command("MON", None, "BDSNUM", None)).await?;
        for reply in self.drain_replies().await? {
            if let CaenReply::Values(values) = reply {
                info!(driver = %self.name, serial = %values.join(";"), "connected to CAEN R1419");
            }
        }
        Ok(())
    }

    /// Build a command line for board 0.
    pub fn command(cmd: &str, channel: Option<u8>, par: &str, value: Option<&str>) -> String {
        let mut line = format!("$BD:00,CMD:{}", cmd);
        if let Some(channel) = channel {
            line.push_str(&format!(",CH:{}", channel));
        }
        line.push_str(&format!(",PAR:{}", par));
        if let Some(value) = value {
            line.push_str(&format!(",VAL:{}", value));
        }
        line
    }

    /// Decode one response line. Lines that do not fit the protocol give `None`.
    pub fn parse_reply(&self, line: &str) -> Option<CaenReply> {
        let line = line.trim();
        if !self.response_pattern.is_match(line) {
            warn!(driver = %self.name, %line, "cannot interpret CAEN response");
            return None;
        }
        let last = line.rsplit(',').next()?;
        if let Some(field) = last.strip_suffix(":ERR") {
            return Some(CaenReply::Error(field.to_string()));
        }
        if last == "CMD:OK" {
            return Some(CaenReply::Ok);
        }
        let values = last.strip_prefix("VAL:")?;
        Some(CaenReply::Values(values.split(';').map(str::to_string).collect()))
    }

    async fn send(&mut self, line: &str) -> AppResult<()> {
        debug!(driver = %self.name, command = %line, "sending CAEN command");
        self.adapter.write_line(line).await
    }

    async fn drain_replies(&mut self) -> AppResult<Vec<CaenReply>> {
        let lines = self.adapter.read_lines().await?;
        let mut replies = Vec::with_capacity(lines.len());
        for line in lines {
            match self.parse_reply(&line) {
                Some(CaenReply::Error(field)) => {
                    warn!(driver = %self.name, %field, "CAEN rejected command");
                }
                Some(reply) => replies.push(reply),
                None => {}
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl OutputDriver for CaenR1419 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, control: f64) -> AppResult<()> {
        let value = format!("{:.2}", control);
        let line = Self::command("SET", Some(self.channel), "VSET", Some(&value));
        self.send(&line).await?;
        // Replies to earlier commands arrive asynchronously; log what is there.
        self.drain_replies().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        info!(driver = %self.name, "switching all CAEN channels off");
        let line = Self::command("SET", Some(ALL_CHANNELS), "OFF", None);
        self.send(&line).await
    }
}
