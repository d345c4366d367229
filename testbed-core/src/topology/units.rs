//! Parsers for the human-friendly quantities used in topology and scenario documents
//!
//! Documents write bandwidths as `100m`, times as `5ms` and ratios as `1%`. YAML also lets
//! operators write bare numbers, so every quantity accepts both forms when deserialized.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    #[error("`{input}` is not a valid {quantity}")]
    Invalid {
        input: String,
        quantity: &'static str,
    },
    #[error("percentage `{0}` is outside of the 0-100 range")]
    PercentOutOfRange(f64),
}

/// Splits `"100mbit"` into `(100.0, "mbit")`
fn split_number(input: &str, quantity: &'static str) -> Result<(f64, String), UnitError> {
    let trimmed = input.trim().to_ascii_lowercase();
    let unit_start = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(unit_start);
    let number = number.parse::<f64>().map_err(|_| UnitError::Invalid {
        input: input.to_string(),
        quantity,
    })?;
    Ok((number, unit.trim().to_string()))
}

/// A bandwidth, stored in megabits per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    pub mbps: f64,
}

impl Bandwidth {
    pub fn from_mbps(mbps: f64) -> Self {
        Self { mbps }
    }
}

impl FromStr for Bandwidth {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, unit) = split_number(s, "bandwidth")?;
        let mbps = match unit.as_str() {
            "" | "m" | "mbit" | "mbps" => number,
            "g" | "gbit" | "gbps" => number * 1000.0,
            "k" | "kbit" | "kbps" => number / 1000.0,
            _ => {
                return Err(UnitError::Invalid {
                    input: s.to_string(),
                    quantity: "bandwidth",
                });
            }
        };

        Ok(Self { mbps })
    }
}

impl Display for Bandwidth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.mbps >= 1.0 {
            write!(f, "{}mbit", self.mbps)
        } else {
            write!(f, "{}kbit", self.mbps * 1000.0)
        }
    }
}

/// A time span as written in documents (`50ms`, `1s`, `100us`; bare numbers are milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan(pub Duration);

impl TimeSpan {
    /// Fails on negative, non-finite and out of range values
    fn try_from_secs(secs: f64, input: &str) -> Result<Self, UnitError> {
        Duration::try_from_secs_f64(secs)
            .map(TimeSpan)
            .map_err(|_| UnitError::Invalid {
                input: input.to_string(),
                quantity: "time span",
            })
    }
}

impl FromStr for TimeSpan {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, unit) = split_number(s, "time span")?;
        let secs = match unit.as_str() {
            "" | "ms" => number / 1_000.0,
            "s" => number,
            "us" => number / 1_000_000.0,
            _ => {
                return Err(UnitError::Invalid {
                    input: s.to_string(),
                    quantity: "time span",
                });
            }
        };

        TimeSpan::try_from_secs(secs, s)
    }
}

impl Display for TimeSpan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let micros = self.0.as_micros();
        if micros % 1_000 == 0 {
            write!(f, "{}ms", micros / 1_000)
        } else {
            write!(f, "{micros}us")
        }
    }
}

/// A percentage in the 0-100 range (`1%`, `0.5%`, or a bare number)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Percent(f64);

impl Percent {
    pub fn new(value: f64) -> Result<Self, UnitError> {
        if !(0.0..=100.0).contains(&value) {
            return Err(UnitError::PercentOutOfRange(value));
        }

        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl FromStr for Percent {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, unit) = split_number(s, "percentage")?;
        if !unit.is_empty() && unit != "%" {
            return Err(UnitError::Invalid {
                input: s.to_string(),
                quantity: "percentage",
            });
        }

        Percent::new(number)
    }
}

impl Display for Percent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    String(String),
}

fn deserialize_quantity<'de, D, T>(
    deserializer: D,
    from_number: impl FnOnce(f64) -> Result<T, UnitError>,
) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr<Err = UnitError>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => from_number(n).map_err(D::Error::custom),
        NumberOrString::String(s) => s.parse().map_err(D::Error::custom),
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_quantity(deserializer, |n| Ok(Bandwidth::from_mbps(n)))
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_quantity(deserializer, |n| {
            TimeSpan::try_from_secs(n / 1_000.0, &n.to_string())
        })
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_quantity(deserializer, Percent::new)
    }
}

macro_rules! serialize_with_display {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }
        )*
    };
}

serialize_with_display!(Bandwidth, TimeSpan, Percent);
