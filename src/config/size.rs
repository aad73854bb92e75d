//! Human-readable byte sizes (`2G`, `200MiB`, `1048576`).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// A size in bytes. Units are binary: `1G` is 1024^3 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SizeRepr", into = "String")]
pub struct ByteSize(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(u64),
    Text(String),
}

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// True if the size is a whole number of MiB.
    pub const fn is_mib_aligned(self) -> bool {
        self.0 % MIB == 0
    }
}

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty size");
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        if digits.is_empty() {
            bail!("Size must start with a number, got: {}", s);
        }
        let value: u64 = digits
            .parse()
            .with_context(|| format!("Invalid size number: {}", s))?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => bail!("Unknown size unit '{}' in '{}' (use K, M, G or T)", other, s),
        };

        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| anyhow::anyhow!("Size overflow: {}", s))
    }
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = anyhow::Error;

    fn try_from(repr: SizeRepr) -> Result<Self> {
        match repr {
            SizeRepr::Bytes(n) => Ok(ByteSize(n)),
            SizeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        for (unit, suffix) in [(TIB, "T"), (GIB, "G"), (MIB, "M"), (KIB, "K")] {
            if n != 0 && n % unit == 0 {
                return write!(f, "{}{}", n / unit, suffix);
            }
        }
        write!(f, "{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("2G".parse::<ByteSize>().unwrap(), ByteSize::gib(2));
        assert_eq!("200M".parse::<ByteSize>().unwrap(), ByteSize::mib(200));
        assert_eq!("512MiB".parse::<ByteSize>().unwrap(), ByteSize::mib(512));
        assert_eq!("1t".parse::<ByteSize>().unwrap().as_bytes(), TIB);
        assert_eq!("4096".parse::<ByteSize>().unwrap().as_bytes(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("G".parse::<ByteSize>().is_err());
        assert!("12X".parse::<ByteSize>().is_err());
        assert!("99999999999T".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_display_picks_largest_exact_unit() {
        assert_eq!(ByteSize::gib(2).to_string(), "2G");
        assert_eq!(ByteSize::mib(200).to_string(), "200M");
        assert_eq!(ByteSize::mib(1536).to_string(), "1536M");
        assert_eq!(ByteSize::bytes(1000).to_string(), "1000");
        assert_eq!(ByteSize::bytes(0).to_string(), "0");
    }

    #[test]
    fn test_serde_accepts_text_and_integers() {
        let from_text: ByteSize = serde_json::from_str("\"200M\"").unwrap();
        let from_int: ByteSize = serde_json::from_str("209715200").unwrap();
        assert_eq!(from_text, from_int);
        assert_eq!(serde_json::to_string(&from_text).unwrap(), "\"200M\"");
    }

    #[test]
    fn test_mib_alignment() {
        assert!(ByteSize::mib(200).is_mib_aligned());
        assert!(!ByteSize::bytes(MIB + 512).is_mib_aligned());
    }
}
