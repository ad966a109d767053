//! Chart ids, package variants and their on-disk names.
//!
//! Every cached package lives directly in the cache directory under a name
//! derived from its id and variant:
//!
//! ```text
//! <cache_dir>/
//! ├── 834.zip         # heavy package (may embed a video)
//! ├── 834.nobga.zip   # light package, only when 834.zip had a video
//! ├── index.json      # last fetched chart index
//! └── recency.json    # least recently used first
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ParseChartIdError;

/// File name suffix of heavy packages.
pub const HEAVY_SUFFIX: &str = ".zip";

/// File name suffix of distinct light packages.
pub const LIGHT_SUFFIX: &str = ".nobga.zip";

/// A positive chart id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ChartId(u32);

impl ChartId {
    /// Create a chart id. Returns `None` for zero.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// The numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChartId {
    type Err = ParseChartIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Reject signs, spaces and leading zeros so ids round-trip to the same file name.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || s.starts_with('0') {
            return Err(ParseChartIdError(s.to_string()));
        }
        s.parse::<u32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ParseChartIdError(s.to_string()))
    }
}

impl TryFrom<u32> for ChartId {
    type Error = ParseChartIdError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| ParseChartIdError(raw.to_string()))
    }
}

impl From<ChartId> for u32 {
    fn from(id: ChartId) -> Self {
        id.0
    }
}

/// Which form of a chart package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Full package, may embed a video.
    Heavy,
    /// Package guaranteed free of embedded video.
    Light,
}

impl Variant {
    /// Map the `wants_light` flag used by callers to a variant.
    #[must_use]
    pub const fn from_light_flag(wants_light: bool) -> Self {
        if wants_light { Self::Light } else { Self::Heavy }
    }

    /// Whether this is the light variant.
    #[must_use]
    pub const fn is_light(self) -> bool {
        matches!(self, Self::Light)
    }

    /// File name suffix for this variant.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Heavy => HEAVY_SUFFIX,
            Self::Light => LIGHT_SUFFIX,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heavy => write!(f, "heavy"),
            Self::Light => write!(f, "light"),
        }
    }
}

/// Canonical file name for a package.
#[must_use]
pub fn artifact_file_name(id: ChartId, variant: Variant) -> String {
    format!("{id}{}", variant.suffix())
}

/// Parse a canonical package file name back into its id and variant.
///
/// Returns `None` for anything that is not exactly `<id>.zip` or
/// `<id>.nobga.zip`.
#[must_use]
pub fn parse_artifact_file_name(name: &str) -> Option<(ChartId, Variant)> {
    // Light first: its suffix also ends in ".zip".
    if let Some(stem) = name.strip_suffix(LIGHT_SUFFIX) {
        return stem.parse().ok().map(|id| (id, Variant::Light));
    }
    name.strip_suffix(HEAVY_SUFFIX)
        .and_then(|stem| stem.parse().ok())
        .map(|id| (id, Variant::Heavy))
}

/// How a successful lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactSource {
    /// Already cached.
    Hit,
    /// Light package built from the cached heavy package.
    Derived,
    /// Fetched from the origin.
    Downloaded,
}

impl std::fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit => write!(f, "cache hit"),
            Self::Derived => write!(f, "derived"),
            Self::Downloaded => write!(f, "downloaded"),
        }
    }
}

/// A cached package ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The chart.
    pub id: ChartId,
    /// The requested variant.
    pub variant: Variant,
    /// Path of the package file. For an aliased light request this is the
    /// heavy package.
    pub path: PathBuf,
    /// How the request was satisfied.
    pub source: ArtifactSource,
}
