//! Tracked pollutant codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pollutant {
    Pm25,
    Pm10,
    No2,
    O3,
    So2,
    Co,
}

pub const ALL_POLLUTANTS: [Pollutant; 6] = [
    Pollutant::Pm25,
    Pollutant::Pm10,
    Pollutant::No2,
    Pollutant::O3,
    Pollutant::So2,
    Pollutant::Co,
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown pollutant code: {0}")]
pub struct UnknownPollutant(pub String);

impl Pollutant {
    /// Column code used in tables and feature names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pm25 => "pm25",
            Self::Pm10 => "pm10",
            Self::No2 => "no2",
            Self::O3 => "o3",
            Self::So2 => "so2",
            Self::Co => "co",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownPollutant> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pm25" | "pm2.5" => Ok(Self::Pm25),
            "pm10" => Ok(Self::Pm10),
            "no2" => Ok(Self::No2),
            "o3" => Ok(Self::O3),
            "so2" => Ok(Self::So2),
            "co" => Ok(Self::Co),
            other => Err(UnknownPollutant(other.to_string())),
        }
    }

    pub fn default_unit(self) -> &'static str {
        match self {
            Self::Co => "ppm",
            _ => "µg/m³",
        }
    }
}

impl std::fmt::Display for Pollutant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}
