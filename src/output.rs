use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ConversionReport, HistoryReport, ValidationReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_conversion(result: &ConversionReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validation(result: &ValidationReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_history(result: &HistoryReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}
