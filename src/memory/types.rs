//! Record types for the memory store: facts, episodes and affinity scores.
//!
//! Everything here is backend-agnostic. Each record converts to and from a
//! full-key JSON map (`to_record` / `from_record`), which is what the codec
//! compacts and what every backend ultimately persists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::CodecError;
use crate::error::{MemoryError, Result};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum length, in characters, of any identity component.
pub const MAX_IDENTITY_LEN: usize = 256;

pub const MIN_IMPORTANCE: f64 = 0.0;
pub const MAX_IMPORTANCE: f64 = 10.0;
pub const MIN_POINTS: i64 = 0;
pub const MAX_POINTS: i64 = 100;

pub const DEFAULT_FACT_SOURCE: &str = "conversation";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MemoryError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(MemoryError::Validation(format!(
                        "unknown {} `{other}`",
                        $label
                    ))),
                }
            }
        }
    };
}

closed_enum! {
    /// What a fact is about.
    FactCategory, "fact category" {
        PersonalInfo => "personal_info",
        Preferences => "preferences",
        Relationships => "relationships",
        Hobbies => "hobbies",
        Goals => "goals",
        Health => "health",
        Work => "work",
        Events => "events",
        Other => "other",
    }
}

closed_enum! {
    EpisodeType, "episode type" {
        Milestone => "milestone",
        EmotionalMoment => "emotional_moment",
        GoalAchievement => "goal_achievement",
        Routine => "routine",
        Conversation => "conversation",
        Other => "other",
    }
}

closed_enum! {
    /// Discrete relationship stage derived from affinity points.
    AffinityLevel, "affinity level" {
        Stranger => "stranger",
        Acquaintance => "acquaintance",
        Friend => "friend",
        CloseFriend => "close_friend",
        BestFriend => "best_friend",
    }
}

impl AffinityLevel {
    /// Fixed thresholds: 0-19, 20-39, 40-59, 60-79, 80-100.
    pub fn from_points(points: i64) -> Self {
        match points {
            i64::MIN..=19 => Self::Stranger,
            20..=39 => Self::Acquaintance,
            40..=59 => Self::Friend,
            60..=79 => Self::CloseFriend,
            _ => Self::BestFriend,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Identity components end up in primary keys and KV key paths.
pub(crate) fn validate_identity(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > MAX_IDENTITY_LEN {
        return Err(MemoryError::Validation(format!(
            "{field} exceeds {MAX_IDENTITY_LEN} characters"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(MemoryError::Validation(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_confidence(confidence: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(MemoryError::Validation(format!(
            "confidence {confidence} is outside [0, 1]"
        )));
    }
    Ok(())
}

pub(crate) fn validate_importance(importance: f64) -> Result<()> {
    if !(MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&importance) {
        return Err(MemoryError::Validation(format!(
            "importance {importance} is outside [{MIN_IMPORTANCE}, {MAX_IMPORTANCE}]"
        )));
    }
    Ok(())
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// RFC 3339, UTC, microsecond precision. Lexicographic order matches
/// chronological order.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Record field access
// ---------------------------------------------------------------------------

fn text_field(record: &Map<String, Value>, field: &'static str) -> Result<String, CodecError> {
    match record.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(CodecError::MissingField(field)),
        Some(other) => Err(CodecError::InvalidValue {
            field,
            reason: format!("expected a string, found {other}"),
        }),
    }
}

fn number_field(record: &Map<String, Value>, field: &'static str) -> Result<f64, CodecError> {
    optional_number_field(record, field)?.ok_or(CodecError::MissingField(field))
}

fn optional_number_field(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, CodecError> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| CodecError::InvalidValue {
            field,
            reason: format!("{n} is not representable as f64"),
        }),
        Some(other) => Err(CodecError::InvalidValue {
            field,
            reason: format!("expected a number, found {other}"),
        }),
    }
}

fn timestamp_field(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, CodecError> {
    let text = text_field(record, field)?;
    parse_timestamp(&text).map_err(|e| CodecError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

fn enum_field<T: FromStr<Err = MemoryError>>(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<T, CodecError> {
    text_field(record, field)?
        .parse()
        .map_err(|e: MemoryError| CodecError::InvalidValue {
            field,
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Fact
// ---------------------------------------------------------------------------

/// A single learned attribute about a user. Identity is
/// `(user_id, category, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub user_id: String,
    pub category: FactCategory,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Caller-supplied fields for `save_fact`. The store stamps the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct FactParams {
    pub user_id: String,
    pub category: FactCategory,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub source: Option<String>,
    pub importance: Option<f64>,
    pub tags: BTreeSet<String>,
}

impl FactParams {
    pub fn new(
        user_id: impl Into<String>,
        category: FactCategory,
        key: impl Into<String>,
        value: impl Into<Value>,
        confidence: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            category,
            key: key.into(),
            value: value.into(),
            confidence,
            source: None,
            importance: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and stamp into a [`Fact`].
    pub fn into_fact(self, timestamp: DateTime<Utc>) -> Result<Fact> {
        let fact = Fact {
            user_id: self.user_id,
            category: self.category,
            key: self.key,
            value: self.value,
            confidence: self.confidence,
            timestamp,
            source: self.source.unwrap_or_else(|| DEFAULT_FACT_SOURCE.to_owned()),
            importance: self.importance,
            tags: self.tags,
        };
        fact.validate()?;
        Ok(fact)
    }
}

impl Fact {
    pub fn validate(&self) -> Result<()> {
        validate_identity("user_id", &self.user_id)?;
        validate_identity("key", &self.key)?;
        validate_confidence(self.confidence)?;
        if let Some(importance) = self.importance {
            validate_importance(importance)?;
        }
        Ok(())
    }

    /// Full-key record in wire field order.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("user_id".into(), Value::String(self.user_id.clone()));
        record.insert("category".into(), Value::String(self.category.as_str().into()));
        record.insert("key".into(), Value::String(self.key.clone()));
        record.insert("value".into(), self.value.clone());
        if let Some(importance) = self.importance {
            record.insert("importance".into(), Value::from(importance));
        }
        record.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        record.insert("source".into(), Value::String(self.source.clone()));
        record.insert("confidence".into(), Value::from(self.confidence));
        record.insert(
            "tags".into(),
            Value::Array(self.tags.iter().cloned().map(Value::String).collect()),
        );
        record
    }

    pub fn from_record(record: &Map<String, Value>) -> Result<Self, CodecError> {
        let tags = match record.get("tags") {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|t| {
                    t.as_str().map(str::to_owned).ok_or_else(|| CodecError::InvalidValue {
                        field: "tags",
                        reason: format!("tag {t} is not a string"),
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(CodecError::InvalidValue {
                    field: "tags",
                    reason: format!("expected a list, found {other}"),
                });
            }
        };
        Ok(Self {
            user_id: text_field(record, "user_id")?,
            category: enum_field(record, "category")?,
            key: text_field(record, "key")?,
            value: record.get("value").cloned().unwrap_or(Value::Null),
            confidence: number_field(record, "confidence")?,
            timestamp: timestamp_field(record, "timestamp")?,
            source: match record.get("source") {
                None | Some(Value::Null) => DEFAULT_FACT_SOURCE.to_owned(),
                Some(_) => text_field(record, "source")?,
            },
            importance: optional_number_field(record, "importance")?,
            tags,
        })
    }
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// A notable conversational event. Append-only; identity is the generated id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub user_id: String,
    pub episode_type: EpisodeType,
    pub title: String,
    pub summary: String,
    pub importance: f64,
    pub sentiment: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Caller-supplied fields for `save_episode`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeParams {
    pub user_id: String,
    pub episode_type: EpisodeType,
    pub title: String,
    pub summary: String,
    pub importance: f64,
    pub sentiment: String,
    pub metadata: Option<Value>,
}

impl EpisodeParams {
    pub fn new(
        user_id: impl Into<String>,
        episode_type: EpisodeType,
        title: impl Into<String>,
        summary: impl Into<String>,
        importance: f64,
        sentiment: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            episode_type,
            title: title.into(),
            summary: summary.into(),
            importance,
            sentiment: sentiment.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate, assign a fresh id and stamp into an [`Episode`].
    pub fn into_episode(self, timestamp: DateTime<Utc>) -> Result<Episode> {
        let episode = Episode {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id,
            episode_type: self.episode_type,
            title: self.title,
            summary: self.summary,
            importance: self.importance,
            sentiment: self.sentiment,
            timestamp,
            metadata: self.metadata,
        };
        episode.validate()?;
        Ok(episode)
    }
}

impl Episode {
    pub fn validate(&self) -> Result<()> {
        validate_identity("user_id", &self.user_id)?;
        validate_identity("episode_id", &self.id)?;
        validate_importance(self.importance)
    }

    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("episode_id".into(), Value::String(self.id.clone()));
        record.insert("user_id".into(), Value::String(self.user_id.clone()));
        record.insert(
            "episode_type".into(),
            Value::String(self.episode_type.as_str().into()),
        );
        record.insert("title".into(), Value::String(self.title.clone()));
        record.insert("summary".into(), Value::String(self.summary.clone()));
        record.insert("importance".into(), Value::from(self.importance));
        record.insert("sentiment".into(), Value::String(self.sentiment.clone()));
        record.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        if let Some(metadata) = &self.metadata {
            record.insert("metadata".into(), metadata.clone());
        }
        record
    }

    pub fn from_record(record: &Map<String, Value>) -> Result<Self, CodecError> {
        Ok(Self {
            id: text_field(record, "episode_id")?,
            user_id: text_field(record, "user_id")?,
            episode_type: enum_field(record, "episode_type")?,
            title: text_field(record, "title")?,
            summary: text_field(record, "summary")?,
            importance: number_field(record, "importance")?,
            sentiment: text_field(record, "sentiment")?,
            timestamp: timestamp_field(record, "timestamp")?,
            metadata: record.get("metadata").filter(|v| !v.is_null()).cloned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Affinity
// ---------------------------------------------------------------------------

/// Accumulated relationship score between a user and a personality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub user_id: String,
    pub personality_name: String,
    pub points: i64,
    pub level: AffinityLevel,
    pub last_interaction: DateTime<Utc>,
    pub interaction_type: String,
}

/// Clamp `current + delta` into `[MIN_POINTS, MAX_POINTS]`.
pub fn accumulate_points(current: i64, delta: i64) -> i64 {
    current.saturating_add(delta).clamp(MIN_POINTS, MAX_POINTS)
}

impl Affinity {
    /// The state after applying `delta` on top of `previous` (or a fresh
    /// zero-point row). Level is recomputed from the clamped points.
    pub fn accumulate(
        previous: Option<&Affinity>,
        user_id: &str,
        personality_name: &str,
        delta: i64,
        interaction_type: &str,
        at: DateTime<Utc>,
    ) -> Self {
        let points = accumulate_points(previous.map_or(MIN_POINTS, |a| a.points), delta);
        Self {
            user_id: user_id.to_owned(),
            personality_name: personality_name.to_owned(),
            points,
            level: AffinityLevel::from_points(points),
            last_interaction: at,
            interaction_type: interaction_type.to_owned(),
        }
    }

    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("user_id".into(), Value::String(self.user_id.clone()));
        record.insert(
            "personality_name".into(),
            Value::String(self.personality_name.clone()),
        );
        record.insert("points".into(), Value::from(self.points));
        record.insert("level".into(), Value::String(self.level.as_str().into()));
        record.insert(
            "last_interaction".into(),
            Value::String(format_timestamp(&self.last_interaction)),
        );
        record.insert(
            "interaction_type".into(),
            Value::String(self.interaction_type.clone()),
        );
        record
    }

    pub fn from_record(record: &Map<String, Value>) -> Result<Self, CodecError> {
        let points = match record.get("points") {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| CodecError::InvalidValue {
                field: "points",
                reason: format!("{n} is not an integer"),
            })?,
            Some(other) if !other.is_null() => {
                return Err(CodecError::InvalidValue {
                    field: "points",
                    reason: format!("expected an integer, found {other}"),
                });
            }
            _ => return Err(CodecError::MissingField("points")),
        };
        Ok(Self {
            user_id: text_field(record, "user_id")?,
            personality_name: text_field(record, "personality_name")?,
            points,
            // Always derived, so a stale stored level can never leak out.
            level: AffinityLevel::from_points(points),
            last_interaction: timestamp_field(record, "last_interaction")?,
            interaction_type: match record.get("interaction_type") {
                None | Some(Value::Null) => String::new(),
                Some(_) => text_field(record, "interaction_type")?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-user aggregate returned by `get_memory_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_facts: usize,
    pub total_episodes: usize,
    pub fact_categories: BTreeMap<String, usize>,
    pub episode_types: BTreeMap<String, usize>,
    pub most_important_episode: Option<Episode>,
}

impl MemoryStats {
    pub fn from_records(facts: &[Fact], episodes: &[Episode]) -> Self {
        let mut stats = Self {
            total_facts: facts.len(),
            total_episodes: episodes.len(),
            ..Self::default()
        };
        for fact in facts {
            *stats
                .fact_categories
                .entry(fact.category.as_str().to_owned())
                .or_default() += 1;
        }
        for episode in episodes {
            *stats
                .episode_types
                .entry(episode.episode_type.as_str().to_owned())
                .or_default() += 1;
        }
        stats.most_important_episode = episodes
            .iter()
            .max_by(|a, b| {
                a.importance
                    .total_cmp(&b.importance)
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
            })
            .cloned();
        stats
    }
}
