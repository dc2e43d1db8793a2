//! A resource `Quantity` in the Kubernetes string form ("500m", "128Mi", "2") together with the
//! helpers needed to turn it into real numbers for resize planning and cgroup math.

use serde::{Deserialize, Serialize};

const KILOBYTE: f64 = 1000.0;
const MEGABYTE: f64 = 1_000_000.0; // 1000 ^ 2
const GIGABYTE: f64 = 1_000_000_000.0; // 1000 ^ 3
const TERABYTE: f64 = 1_000_000_000_000.0; // 1000 ^ 4
const PETABYTE: f64 = 1_000_000_000_000_000.0; // 1000 ^ 5
const EXABYTE: f64 = 1_000_000_000_000_000_000.0; // 1000 ^ 6
const KIBIBYTE: f64 = 1024.0;
const MEBIBYTE: f64 = 1_048_576.0; // 1024 ^ 2
const GIBIBYTE: f64 = 1_073_741_824.0; // 1024 ^ 3
const TEBIBYTE: f64 = 1_099_511_627_776.0; // 1024 ^ 4
const PEBIBYTE: f64 = 1_125_899_906_842_624.0; // 1024 ^ 5
const EXBIBYTE: f64 = 1_152_921_504_606_846_976.0; // 1024 ^ 6
const MILLI: f64 = 1.0 / 1000.0;

/// A quantity as it appears in a pod manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    /// Builds a CPU quantity from millicores, e.g. `1500` becomes `"1500m"`.
    pub fn from_milli_cpu(milli: i64) -> Self {
        Quantity(format!("{}m", milli))
    }

    /// Builds a plain integer quantity, used for memory byte counts.
    pub fn from_value(value: i64) -> Self {
        Quantity(value.to_string())
    }

    /// The quantity scaled by 1000 and rounded up, which is the natural unit for CPU.
    ///
    /// Returns an error if the numeric part cannot be parsed.
    pub fn milli_value(&self) -> anyhow::Result<i64> {
        let (number, suffix) = self.split()?;
        let milli = match suffix {
            Suffix::Milli => number,
            other => number * other.get_value() * 1000.0,
        };
        Ok(ceil(milli))
    }

    /// The quantity in base units rounded up, which is the natural unit for memory (bytes).
    pub fn value(&self) -> anyhow::Result<i64> {
        let (number, suffix) = self.split()?;
        Ok(ceil(number * suffix.get_value()))
    }

    fn split(&self) -> anyhow::Result<(f64, Suffix)> {
        let suffix = get_suffix(self);
        let raw = self.0.trim().trim_end_matches(char::is_alphabetic);
        if raw.is_empty() {
            anyhow::bail!("quantity {:?} has no numeric part", self.0)
        }
        let parsed: f64 = raw.parse()?;
        Ok((parsed, suffix))
    }
}

// Float noise from suffix multiplication must not bump an exact value to the next integer.
fn ceil(v: f64) -> i64 {
    let rounded = v.round();
    if (v - rounded).abs() < 1e-6 {
        rounded as i64
    } else {
        v.ceil() as i64
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Quantity {
    fn from(s: &str) -> Self {
        Quantity(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Suffix {
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
    Petabyte,
    Exabyte,
    Kibibyte,
    Mebibyte,
    Gibibyte,
    Tebibyte,
    Pebibyte,
    Exbibyte,
    Milli,
    None,
}

impl Suffix {
    /// Returns the multiplier that converts a number carrying this suffix to base units.
    pub(crate) const fn get_value(&self) -> f64 {
        match &self {
            Self::Kilobyte => KILOBYTE,
            Self::Megabyte => MEGABYTE,
            Self::Gigabyte => GIGABYTE,
            Self::Terabyte => TERABYTE,
            Self::Petabyte => PETABYTE,
            Self::Exabyte => EXABYTE,
            Self::Kibibyte => KIBIBYTE,
            Self::Mebibyte => MEBIBYTE,
            Self::Gibibyte => GIBIBYTE,
            Self::Tebibyte => TEBIBYTE,
            Self::Pebibyte => PEBIBYTE,
            Self::Exbibyte => EXBIBYTE,
            Self::Milli => MILLI,
            Self::None => 1.0,
        }
    }
}

/// Fetches the suffix of a quantity. No validation happens here: a malformed quantity or an
/// unrecognized suffix yields `Suffix::None`.
pub(crate) fn get_suffix(q: &Quantity) -> Suffix {
    let raw = q.0.trim();
    if raw.is_empty() {
        return Suffix::None;
    }
    let raw_suffix = match raw.rsplit_once(char::is_numeric) {
        None => raw,
        Some((_, suffix)) => suffix,
    };
    match raw_suffix {
        "m" => Suffix::Milli,
        "k" | "K" => Suffix::Kilobyte,
        "M" => Suffix::Megabyte,
        "G" => Suffix::Gigabyte,
        "T" => Suffix::Terabyte,
        "P" => Suffix::Petabyte,
        "E" => Suffix::Exabyte,
        "Ki" => Suffix::Kibibyte,
        "Mi" => Suffix::Mebibyte,
        "Gi" => Suffix::Gibibyte,
        "Ti" => Suffix::Tebibyte,
        "Pi" => Suffix::Pebibyte,
        "Ei" => Suffix::Exbibyte,
        _ => Suffix::None,
    }
}
