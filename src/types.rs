use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of one manifest snapshot. The remote publishes it as a
/// plain-text integer; surrounding whitespace is ignored when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Rule for deriving the remote object name from a manifest identifier of
/// the form `prefix_objectname`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SplitPolicy {
    /// Object name is everything after the last separator.
    #[default]
    Last,
    /// Object name is everything after the first separator.
    First,
}

impl SplitPolicy {
    pub const SEPARATOR: char = '_';

    /// Map a manifest identifier to the name of the object to fetch.
    /// Identifiers without a separator are used verbatim.
    pub fn object_name<'a>(&self, identifier: &'a str) -> &'a str {
        let split = match self {
            SplitPolicy::Last => identifier.rsplit_once(Self::SEPARATOR),
            SplitPolicy::First => identifier.split_once(Self::SEPARATOR),
        };
        match split {
            Some((_, name)) if !name.is_empty() => name,
            _ => identifier,
        }
    }
}
