//! Workload settings and their wire layout
//!
//! ```text
//! +------------------+---------+------------------+
//! | total_throws (8) | has (1) | seed (8)         |
//! +------------------+---------+------------------+
//! ```

use clap::Parser;
use spmd::prelude::*;
use tracing::warn;

/// Throws used when `-t` is not given
pub const DEFAULT_TOTAL_THROWS: u64 = 5_000_000;

/// What the manager distributes to every task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiSettings {
    /// Darts thrown across the whole group
    pub total_throws: u64,
    /// Base seed; `None` seeds every task from entropy
    pub seed: Option<u64>,
}

impl Default for PiSettings {
    fn default() -> Self {
        Self {
            total_throws: DEFAULT_TOTAL_THROWS,
            seed: None,
        }
    }
}

/// Workload flags, parsed by the manager only
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct PiArgs {
    /// Total throws at the dartboard
    #[arg(short = 't', long = "throws")]
    throws: Option<u64>,

    /// Base RNG seed; each task offsets it by its rank
    #[arg(short = 's', long)]
    seed: Option<u64>,
}

impl PiSettings {
    /// Parse workload arguments. Any malformed input is [`ErrorCode::Args`].
    pub fn from_args(args: &[String]) -> Result<Self, ErrorCode> {
        let parsed = PiArgs::try_parse_from(args).map_err(|e| {
            warn!(error = %e.kind(), ?args, "bad workload arguments");
            eprintln!("{}", e.render());
            ErrorCode::Args
        })?;
        Ok(Self {
            total_throws: parsed.throws.unwrap_or(DEFAULT_TOTAL_THROWS),
            seed: parsed.seed,
        })
    }
}

impl WireRecord for PiSettings {
    const WIRE_SIZE: usize = 17;

    fn encode(&self, buf: &mut [u8]) {
        self.total_throws.encode(&mut buf[..8]);
        buf[8] = u8::from(self.seed.is_some());
        self.seed.unwrap_or(0).encode(&mut buf[9..]);
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let total_throws = u64::decode(&buf[..8])?;
        let seed = u64::decode(&buf[9..])?;
        let seed = match buf[8] {
            0 => None,
            1 => Some(seed),
            other => {
                return Err(WireError::InvalidField {
                    field: "seed",
                    reason: format!("presence byte is {other}"),
                });
            }
        };
        Ok(Self { total_throws, seed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_without_args() {
        assert_eq!(PiSettings::from_args(&[]), Ok(PiSettings::default()));
    }

    #[test]
    fn test_short_and_long_flags() {
        let s = PiSettings::from_args(&args(&["-t", "1000"])).unwrap();
        assert_eq!(s.total_throws, 1000);
        let s = PiSettings::from_args(&args(&["--throws", "42", "--seed", "7"])).unwrap();
        assert_eq!(s.total_throws, 42);
        assert_eq!(s.seed, Some(7));
    }

    #[test]
    fn test_missing_value_is_args_error() {
        assert_eq!(PiSettings::from_args(&args(&["-t"])), Err(ErrorCode::Args));
    }

    #[test]
    fn test_malformed_args_are_args_error() {
        assert_eq!(
            PiSettings::from_args(&args(&["-t", "lots"])),
            Err(ErrorCode::Args)
        );
        assert_eq!(
            PiSettings::from_args(&args(&["--darts", "3"])),
            Err(ErrorCode::Args)
        );
        assert_eq!(
            PiSettings::from_args(&args(&["-t", "-5"])),
            Err(ErrorCode::Args)
        );
    }

    #[test]
    fn test_wire_layout() {
        let settings = PiSettings {
            total_throws: 0x0102,
            seed: Some(9),
        };
        let bytes = settings.to_wire();
        assert_eq!(bytes.len(), PiSettings::WIRE_SIZE);
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 9);
        assert_eq!(PiSettings::from_wire(&bytes), Ok(settings));
    }

    #[test]
    fn test_bad_presence_byte_rejected() {
        let mut bytes = PiSettings::default().to_wire();
        bytes[8] = 2;
        assert!(matches!(
            PiSettings::from_wire(&bytes),
            Err(WireError::InvalidField { field: "seed", .. })
        ));
    }
}
