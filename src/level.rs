use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity attached to log records.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            _ => Err(()),
        }
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Numeric severity used on the wire: verbose 0 through critical 4.
    pub fn wire_level(&self) -> u8 {
        match self {
            Severity::Trace | Severity::Debug => 0,
            Severity::Info => 1,
            Severity::Warn => 2,
            Severity::Error => 3,
            Severity::Critical => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("trace", Some(Severity::Trace))]
    #[case("Warning", Some(Severity::Warn))]
    #[case("FATAL", Some(Severity::Critical))]
    #[case("bogus", None)]
    fn parse_cases(#[case] input: &str, #[case] expected: Option<Severity>) {
        assert_eq!(input.parse::<Severity>().ok(), expected);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let text = Severity::Error.to_string();
        assert_eq!(text, "ERROR");
        assert_eq!(text.parse::<Severity>(), Ok(Severity::Error));
    }

    #[rstest]
    #[case(Severity::Trace, 0)]
    #[case(Severity::Debug, 0)]
    #[case(Severity::Info, 1)]
    #[case(Severity::Warn, 2)]
    #[case(Severity::Error, 3)]
    #[case(Severity::Critical, 4)]
    fn wire_levels(#[case] severity: Severity, #[case] expected: u8) {
        assert_eq!(severity.wire_level(), expected);
    }
}
