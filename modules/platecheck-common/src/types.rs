use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Analysis depth. Partitions the cache namespace: the same place can hold
/// one cached report per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Quick,
    Deep,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Deep => "deep",
        }
    }

    /// How many reviews a single interactive analysis scrapes by default.
    pub fn default_max_reviews(&self) -> u32 {
        match self {
            Mode::Quick => 30,
            Mode::Deep => 90,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Mode::Quick),
            "deep" => Ok(Mode::Deep),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// How the raw input was interpreted by the identity resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Url,
    ShortUrl,
    Search,
}

/// A place reference reduced to canonical form.
///
/// `identity_key` is the stable dedup key: the same real-world place always
/// resolves to the same key regardless of surface URL form. Free-text
/// searches live in a distinct `search:` namespace so they can never collide
/// with URL-derived keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReference {
    pub reference_url: String,
    pub identity_key: String,
    pub display_name: String,
    pub place_id: Option<String>,
    pub cid: Option<String>,
    pub input_kind: InputKind,
}
