use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::GamelibError;

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar", ".zip", ".7z", ".rar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Iso,
    Xbla,
}

impl LinkType {
    pub const ALL: [LinkType; 2] = [LinkType::Iso, LinkType::Xbla];

    /// Whether entries of this type carry a disk image that is repacked
    /// into the console-native container before placement.
    pub fn requires_conversion(self) -> bool {
        matches!(self, LinkType::Iso)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Iso => "ISO",
            LinkType::Xbla => "XBLA",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = GamelibError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ISO" => Ok(LinkType::Iso),
            "XBLA" => Ok(LinkType::Xbla),
            _ => Err(GamelibError::ConfigParse(format!("unknown link type: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn derive(link_type: LinkType, name: &str) -> Self {
        Self(format!("{link_type}:{}", name.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub id: EntryId,
    pub name: String,
    pub url: String,
    pub link_type: LinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub downloaded: bool,
    pub extracted: bool,
    pub converted: bool,
    pub placed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<String>,
}

impl LinkEntry {
    pub fn new(name: impl Into<String>, url: impl Into<String>, link_type: LinkType) -> Self {
        let name = name.into();
        Self {
            id: EntryId::derive(link_type, &name),
            name,
            url: url.into(),
            link_type,
            size_bytes: None,
            downloaded: false,
            extracted: false,
            converted: false,
            placed: false,
            last_error: None,
            last_attempt: None,
        }
    }

    /// Builds a fresh entry from a raw archive URL, naming it after the
    /// decoded last path segment with its archive suffix removed.
    pub fn from_url(url: &str, link_type: LinkType) -> Result<Self, GamelibError> {
        let trimmed = url.trim();
        let parsed =
            Url::parse(trimmed).map_err(|err| GamelibError::InvalidUrl(format!("{trimmed}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(GamelibError::InvalidUrl(format!(
                "{trimmed}: unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let segment = url_file_name(trimmed).unwrap_or_default();
        let name = strip_archive_suffix(&segment).trim().to_string();
        if name.is_empty() {
            return Err(GamelibError::InvalidUrl(format!(
                "{trimmed}: no file name in path"
            )));
        }
        Ok(Self::new(name, trimmed, link_type))
    }

    /// Declared size, with `0` treated as unknown.
    pub fn known_size(&self) -> Option<u64> {
        self.size_bytes.filter(|size| *size > 0)
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.as_str().trim().is_empty() {
            return Err("entry with empty id".to_string());
        }
        if self.placed && !self.extracted {
            return Err(format!("{}: placed without extracted", self.id));
        }
        if self.extracted && !self.downloaded {
            return Err(format!("{}: extracted without downloaded", self.id));
        }
        if self.converted && !self.extracted {
            return Err(format!("{}: converted without extracted", self.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TypeFilter {
    Iso,
    Xbla,
    #[default]
    All,
}

impl TypeFilter {
    pub fn matches(self, link_type: LinkType) -> bool {
        match self {
            TypeFilter::Iso => link_type == LinkType::Iso,
            TypeFilter::Xbla => link_type == LinkType::Xbla,
            TypeFilter::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompletionFilter {
    #[default]
    Incomplete,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryFilter {
    pub link_type: TypeFilter,
    pub completion: CompletionFilter,
}

impl EntryFilter {
    pub fn new(link_type: TypeFilter, completion: CompletionFilter) -> Self {
        Self {
            link_type,
            completion,
        }
    }

    pub fn matches(&self, entry: &LinkEntry) -> bool {
        let wanted = match self.completion {
            CompletionFilter::Incomplete => !entry.placed,
            CompletionFilter::All => true,
        };
        wanted && self.link_type.matches(entry.link_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    #[default]
    BySize,
    ByCount,
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchMode::BySize => write!(f, "by-size"),
            BatchMode::ByCount => write!(f, "by-count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    Append,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Download,
    Extract,
    Convert,
    Place,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Pending => "pending",
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Convert => "convert",
            Stage::Place => "place",
        };
        f.write_str(label)
    }
}

/// Decoded final path segment of an archive URL, if it has one.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let decoded = percent_decode(segment);
    (!decoded.trim().is_empty()).then_some(decoded)
}

/// Known archive suffix of a file name, lowercased (`.tar.gz` before `.gz`).
pub fn archive_suffix(file_name: &str) -> Option<&'static str> {
    let lower = file_name.to_ascii_lowercase();
    ARCHIVE_SUFFIXES
        .iter()
        .copied()
        .find(|suffix| lower.ends_with(suffix))
}

fn strip_archive_suffix(name: &str) -> &str {
    match archive_suffix(name) {
        Some(suffix) => &name[..name.len() - suffix.len()],
        None => name,
    }
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
