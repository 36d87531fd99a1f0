use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{BidsError, ResolutionError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Label {
    type Err = ResolutionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let trimmed = trimmed
            .strip_prefix("sub-")
            .or_else(|| trimmed.strip_prefix("ses-"))
            .unwrap_or(trimmed);
        let normalized: String = trimmed
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect();
        if normalized.is_empty() {
            return Err(ResolutionError::InvalidLabel(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Anat,
    Beh,
    Dwi,
    Eeg,
    Fmap,
    Func,
    Ieeg,
    Meg,
    Micr,
    Motion,
    Nirs,
    Perf,
    Pet,
}

impl Datatype {
    pub fn as_str(self) -> &'static str {
        match self {
            Datatype::Anat => "anat",
            Datatype::Beh => "beh",
            Datatype::Dwi => "dwi",
            Datatype::Eeg => "eeg",
            Datatype::Fmap => "fmap",
            Datatype::Func => "func",
            Datatype::Ieeg => "ieeg",
            Datatype::Meg => "meg",
            Datatype::Micr => "micr",
            Datatype::Motion => "motion",
            Datatype::Nirs => "nirs",
            Datatype::Perf => "perf",
            Datatype::Pet => "pet",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "anat" => Ok(Datatype::Anat),
            "beh" => Ok(Datatype::Beh),
            "dwi" => Ok(Datatype::Dwi),
            "eeg" => Ok(Datatype::Eeg),
            "fmap" => Ok(Datatype::Fmap),
            "func" => Ok(Datatype::Func),
            "ieeg" => Ok(Datatype::Ieeg),
            "meg" => Ok(Datatype::Meg),
            "micr" => Ok(Datatype::Micr),
            "motion" => Ok(Datatype::Motion),
            "nirs" => Ok(Datatype::Nirs),
            "perf" => Ok(Datatype::Perf),
            "pet" => Ok(Datatype::Pet),
            _ => Err(BidsError::InvalidDatatype(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a source asset, built from its biobank codes rather
/// than its path: `<eid>:<instance|->:<field>:<array>[:<tags>]:<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(
        subject: &str,
        instance: Option<u32>,
        field: u32,
        array: u32,
        tags: &[String],
        extension: &str,
    ) -> Self {
        let instance = instance
            .map(|value| value.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut key = format!("{subject}:{instance}:{field}:{array}");
        if !tags.is_empty() {
            key.push(':');
            key.push_str(&tags.join("_"));
        }
        key.push(':');
        key.push_str(extension);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn subject(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    pub fn field(&self) -> Option<u32> {
        self.0.split(':').nth(2).and_then(|value| value.parse().ok())
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceKey {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts = trimmed.split(':').collect::<Vec<_>>();
        let numeric = |part: &str| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit());
        let is_valid = (parts.len() == 5 || parts.len() == 6)
            && parts.iter().all(|part| !part.is_empty())
            && (parts[1] == "-" || numeric(parts[1]))
            && numeric(parts[2])
            && numeric(parts[3]);
        if !is_valid {
            return Err(BidsError::InvalidSourceKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawAsset {
    pub path: Utf8PathBuf,
    pub relative: Utf8PathBuf,
    pub size: u64,
    pub fingerprint: Fingerprint,
}

impl RawAsset {
    pub fn file_name(&self) -> &str {
        self.relative.file_name().unwrap_or_default()
    }

    pub fn tokens(&self) -> Vec<&str> {
        let name = self.file_name();
        let stem = name.split_once('.').map(|(stem, _)| stem).unwrap_or(name);
        stem.split('_').filter(|token| !token.is_empty()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BidsEntity {
    pub subject: Label,
    pub session: Option<Label>,
    pub datatype: Datatype,
    pub suffix: String,
    pub run: Option<u32>,
    pub extension: String,
}

impl BidsEntity {
    pub fn file_name(&self) -> String {
        let mut name = format!("sub-{}", self.subject);
        if let Some(session) = &self.session {
            name.push_str(&format!("_ses-{session}"));
        }
        name.push('_');
        name.push_str(&self.suffix);
        if let Some(run) = self.run {
            name.push_str(&format!("_run-{run}"));
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }

    pub fn directory(&self) -> Utf8PathBuf {
        let mut dir = Utf8PathBuf::from(format!("sub-{}", self.subject));
        if let Some(session) = &self.session {
            dir.push(format!("ses-{session}"));
        }
        dir.push(self.datatype.as_str());
        dir
    }

    pub fn relative_path(&self) -> Utf8PathBuf {
        self.directory().join(self.file_name())
    }
}
