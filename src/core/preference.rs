/// Read preferences: which endpoint roles may serve an operation
use crate::config::ConfigError;
use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Smallest `maxStalenessSeconds` a server accepts
pub const MIN_MAX_STALENESS: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPreferenceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "primarypreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "secondarypreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            _ => Err(ConfigError::invalid_option(
                "readPreference",
                format!("unknown mode '{s}'"),
            )),
        }
    }
}

/// A set of key/value constraints; an endpoint matches when it advertises
/// every pair. The empty set matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        TagSet(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_document(&self) -> Document {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
            .collect()
    }
}

impl FromStr for TagSet {
    type Err = ConfigError;

    /// Parse the `readPreferenceTags` form: `dc:ny,rack:1` (empty = match any)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = BTreeMap::new();
        for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (k, v) = pair.split_once(':').ok_or_else(|| {
                ConfigError::invalid_option("readPreferenceTags", format!("'{pair}' is not key:value"))
            })?;
            tags.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(TagSet(tags))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

/// Read preference attached to an operation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preference {
    pub mode: ReadPreferenceMode,
    /// Secondaries lagging the primary by more than this are ineligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_ms: Option<u64>,
    /// Tried in order; the first set matching any candidate wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_sets: Vec<TagSet>,
}

impl Preference {
    pub fn primary() -> Self {
        Self::with_mode(ReadPreferenceMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::with_mode(ReadPreferenceMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::with_mode(ReadPreferenceMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::with_mode(ReadPreferenceMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::with_mode(ReadPreferenceMode::Nearest)
    }

    pub fn with_mode(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            max_staleness_ms: None,
            tag_sets: Vec::new(),
        }
    }

    pub fn tags(mut self, tag_set: TagSet) -> Self {
        self.tag_sets.push(tag_set);
        self
    }

    pub fn max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness_ms = Some(max_staleness.as_millis() as u64);
        self
    }

    pub fn max_staleness_duration(&self) -> Option<Duration> {
        self.max_staleness_ms.map(Duration::from_millis)
    }

    /// Primary mode cannot carry tags or a staleness bound
    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<(), ConfigError> {
        if self.mode == ReadPreferenceMode::Primary {
            if self.tag_sets.iter().any(|t| !t.is_empty()) {
                return Err(ConfigError::invalid_option(
                    "readPreferenceTags",
                    "tags cannot be combined with mode primary",
                ));
            }
            if self.max_staleness_ms.is_some() {
                return Err(ConfigError::invalid_option(
                    "maxStalenessSeconds",
                    "staleness cannot be combined with mode primary",
                ));
            }
        }

        if let Some(max_staleness) = self.max_staleness_duration() {
            let floor = MIN_MAX_STALENESS.max(heartbeat_frequency + Duration::from_secs(10));
            if max_staleness < floor {
                return Err(ConfigError::invalid_option(
                    "maxStalenessSeconds",
                    format!("must be at least {} seconds", floor.as_secs()),
                ));
            }
        }

        Ok(())
    }

    /// `$readPreference` document sent alongside non-primary reads
    pub fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };
        if !self.tag_sets.is_empty() {
            let tags: Vec<Bson> = self
                .tag_sets
                .iter()
                .map(|t| Bson::Document(t.to_document()))
                .collect();
            document.insert("tags", tags);
        }
        if let Some(ms) = self.max_staleness_ms {
            document.insert("maxStalenessSeconds", (ms / 1000) as i64);
        }
        document
    }
}

impl fmt::Display for Preference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if !self.tag_sets.is_empty() {
            let sets: Vec<String> = self.tag_sets.iter().map(|t| t.to_string()).collect();
            write!(f, " tags=[{}]", sets.join(","))?;
        }
        if let Some(ms) = self.max_staleness_ms {
            write!(f, " maxStaleness={}s", ms / 1000)?;
        }
        Ok(())
    }
}
