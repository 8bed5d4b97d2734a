//! IP filtering
//!
//! Banned address ranges applied at connection-accept and dial time.
//! The range list usually comes from an external filter-file parser;
//! the lenient text loader here accepts the common `start - end` line
//! format and reports malformed lines as line-numbered warnings
//! instead of failing the whole file.

use std::net::IpAddr;

use anyhow::Result;
use tracing::{debug, info};

use crate::error::EngineError;

/// A non-fatal problem found while loading a filter file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterWarning {
    pub line: usize,
    pub message: String,
}

/// Banned address ranges, kept separately per address family
#[derive(Debug, Default)]
pub struct IpFilter {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl IpFilter {
    /// A filter that blocks nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of loaded ranges
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// True when no ranges are loaded
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Add one inclusive banned range
    pub fn add_range(&mut self, start: IpAddr, end: IpAddr) -> Result<()> {
        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                let (s, e) = (u32::from(s), u32::from(e));
                if s > e {
                    return Err(EngineError::config("range start after end").into());
                }
                self.v4.push((s, e));
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                let (s, e) = (u128::from(s), u128::from(e));
                if s > e {
                    return Err(EngineError::config("range start after end").into());
                }
                self.v6.push((s, e));
            }
            _ => {
                return Err(EngineError::config("mixed address families in range").into());
            }
        }
        Ok(())
    }

    /// True when the address falls in any banned range
    pub fn is_blocked(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => {
                let ip = u32::from(*ip);
                self.v4.iter().any(|(s, e)| (*s..=*e).contains(&ip))
            }
            IpAddr::V6(ip) => {
                let ip = u128::from(*ip);
                self.v6.iter().any(|(s, e)| (*s..=*e).contains(&ip))
            }
        }
    }

    /// Load ranges from filter-file text
    ///
    /// Recognized lines: `start - end`, optionally followed by
    /// `, level, comment` fields which are ignored. Blank lines and
    /// `#` comments are skipped. Malformed lines become warnings.
    pub fn parse(text: &str) -> (Self, Vec<FilterWarning>) {
        let mut filter = Self::empty();
        let mut warnings = Vec::new();

        for (number, raw) in text.lines().enumerate() {
            let number = number + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Trailing ", level, comment" fields are ignored
            let range_part = line.split(',').next().unwrap_or(line).trim();
            let Some((start_text, end_text)) = range_part.split_once('-') else {
                warnings.push(FilterWarning {
                    line: number,
                    message: "expected 'start - end'".to_string(),
                });
                continue;
            };
            let start = start_text.trim().parse::<IpAddr>();
            let end = end_text.trim().parse::<IpAddr>();
            match (start, end) {
                (Ok(start), Ok(end)) => {
                    if let Err(e) = filter.add_range(start, end) {
                        warnings.push(FilterWarning {
                            line: number,
                            message: e.to_string(),
                        });
                    }
                }
                _ => {
                    warnings.push(FilterWarning {
                        line: number,
                        message: "unparseable address".to_string(),
                    });
                }
            }
        }
        info!(
            ranges = filter.len(),
            warnings = warnings.len(),
            "ip filter loaded"
        );
        for warning in &warnings {
            debug!(line = warning.line, message = %warning.message, "filter line skipped");
        }
        (filter, warnings)
    }
}
