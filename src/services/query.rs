//! Query predicates.
//!
//! Requests carry a map of `field -> (operator, value)`. It is decoded once,
//! here, into a [`PredicateSet`]; metadata stores translate that structured
//! form into their native query operations and never see raw strings.
//!
//! | operator | value                 | applies to          |
//! |----------|-----------------------|---------------------|
//! | `kw`     | literal               | all but time fields |
//! | `text`   | free text             | text fields         |
//! | `range`  | `min,max`             | numeric fields      |
//! | `time`   | `start,end` (RFC3339) | time fields         |
//! | `geo`    | `lon,lat,distance`    | text fields         |

use crate::models::blob::BlobRecord;
use crate::services::error::{BlobError, BlobResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Meters per degree of arc on a sphere with the mean Earth radius.
pub const METERS_PER_DEGREE: f64 = 111_195.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Id,
    Name,
    Description,
    Categories,
    Tags,
    ContentType,
    Path,
    ContentHash,
    Size,
    UploadTime,
    AuthorId,
    IsPublic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Matched as a whole value only.
    Keyword,
    /// Tokenized for `text` matching; whole value for `kw`.
    Text,
    Numeric,
    Time,
    Flag,
}

impl Field {
    pub const TEXT: [Field; 4] = [Field::Name, Field::Description, Field::Categories, Field::Tags];

    pub const KEYWORD: [Field; 9] = [
        Field::Id,
        Field::Name,
        Field::Description,
        Field::Categories,
        Field::Tags,
        Field::ContentType,
        Field::Path,
        Field::ContentHash,
        Field::AuthorId,
    ];

    /// Resolve a wire field name.
    pub fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "id" => Field::Id,
            "name" => Field::Name,
            "desc" | "description" => Field::Description,
            "categories" => Field::Categories,
            "tags" => Field::Tags,
            "contentType" => Field::ContentType,
            "path" => Field::Path,
            "md5" | "contentHash" => Field::ContentHash,
            "size" => Field::Size,
            "uploadTime" => Field::UploadTime,
            "authorId" => Field::AuthorId,
            "isPublic" => Field::IsPublic,
            _ => return None,
        };
        Some(field)
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::Name | Field::Description | Field::Categories | Field::Tags => FieldKind::Text,
            Field::Size => FieldKind::Numeric,
            Field::UploadTime => FieldKind::Time,
            Field::IsPublic => FieldKind::Flag,
            Field::Id | Field::ContentType | Field::Path | Field::ContentHash | Field::AuthorId => {
                FieldKind::Keyword
            }
        }
    }

    /// Column holding this field in the relational store.
    pub fn column(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Name => "name",
            Field::Description => "description",
            Field::Categories => "categories",
            Field::Tags => "tags",
            Field::ContentType => "content_type",
            Field::Path => "path",
            Field::ContentHash => "content_hash",
            Field::Size => "size",
            Field::UploadTime => "upload_time",
            Field::AuthorId => "author_id",
            Field::IsPublic => "is_public",
        }
    }

    /// Column holding the space-delimited term list of a text field.
    pub fn terms_column(self) -> Option<&'static str> {
        match self {
            Field::Name => Some("name_terms"),
            Field::Description => Some("description_terms"),
            Field::Categories => Some("categories_terms"),
            Field::Tags => Some("tags_terms"),
            _ => None,
        }
    }

    /// Columns holding the parsed `lon,lat` point of a text field.
    pub fn point_columns(self) -> Option<(&'static str, &'static str)> {
        match self {
            Field::Name => Some(("name_lon", "name_lat")),
            Field::Description => Some(("description_lon", "description_lat")),
            Field::Categories => Some(("categories_lon", "categories_lat")),
            Field::Tags => Some(("tags_lon", "tags_lat")),
            _ => None,
        }
    }

    /// String value of a keyword or text field.
    pub fn string_value(self, record: &BlobRecord) -> Option<&str> {
        match self {
            Field::Id => Some(&record.id),
            Field::Name => Some(&record.name),
            Field::Description => Some(&record.description),
            Field::Categories => Some(&record.categories),
            Field::Tags => Some(&record.tags),
            Field::ContentType => record.content_type.as_deref(),
            Field::Path => record.path.as_deref(),
            Field::ContentHash => record.content_hash.as_deref(),
            Field::AuthorId => Some(&record.author_id),
            Field::Size | Field::UploadTime | Field::IsPublic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exact {
    Text(String),
    Number(f64),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `kw`: whole-value equality.
    Exact(Exact),
    /// `text`: any of the lowercase terms occurs in the field.
    Text(Vec<String>),
    /// `range`: inclusive numeric range.
    Range { min: f64, max: f64 },
    /// `time`: inclusive time range.
    Time {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// `geo`: field holds a `lon,lat` point within `radius_m` of `center`.
    Geo { center: GeoPoint, radius_m: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: Field,
    pub predicate: Predicate,
}

/// Conjunction of per-field conditions. Empty matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateSet {
    conditions: Vec<Condition>,
}

impl PredicateSet {
    pub fn all() -> Self {
        Self::default()
    }

    /// Decode `(field, operator, value)` triples.
    pub fn decode<I, F, O, V>(items: I) -> BlobResult<Self>
    where
        I: IntoIterator<Item = (F, O, V)>,
        F: AsRef<str>,
        O: AsRef<str>,
        V: AsRef<str>,
    {
        let mut conditions = items
            .into_iter()
            .map(|(field, op, value)| decode_condition(field.as_ref(), op.as_ref(), value.as_ref()))
            .collect::<BlobResult<Vec<_>>>()?;
        conditions.sort_by_key(|c| c.field);
        Ok(Self { conditions })
    }

    /// Decode `field -> "op=value"` pairs, splitting at the first `=` only so
    /// values may themselves contain `=`.
    pub fn from_encoded(raw: &HashMap<String, String>) -> BlobResult<Self> {
        Self::decode(raw.iter().map(|(field, encoded)| {
            let (op, value) = encoded.split_once('=').unwrap_or(("", encoded.as_str()));
            (field.as_str(), op, value)
        }))
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Query terms of every `text` condition, for relevance scoring.
    pub fn text_terms(&self) -> impl Iterator<Item = (Field, &str)> {
        self.conditions.iter().flat_map(|c| match &c.predicate {
            Predicate::Text(terms) => terms.iter().map(|t| (c.field, t.as_str())).collect::<Vec<_>>(),
            _ => Vec::new(),
        })
    }
}

fn decode_condition(name: &str, op: &str, value: &str) -> BlobResult<Condition> {
    let unsupported = || BlobError::UnsupportedOperator {
        field: name.to_string(),
        operator: op.to_string(),
    };
    if !matches!(op, "kw" | "text" | "range" | "time" | "geo") {
        return Err(unsupported());
    }
    let field = Field::parse(name).ok_or_else(|| BlobError::invalid_value(name, "unknown field"))?;
    let kind = field.kind();
    let mismatch = |wants: &str| BlobError::invalid_value(name, format!("`{}` requires a {} field", op, wants));

    let predicate = match op {
        "kw" => Predicate::Exact(match kind {
            FieldKind::Keyword | FieldKind::Text => Exact::Text(value.to_string()),
            FieldKind::Numeric => Exact::Number(parse_number(name, value)?),
            FieldKind::Flag => Exact::Flag(parse_flag(name, value)?),
            FieldKind::Time => return Err(mismatch("non-time")),
        }),
        "text" => {
            if kind != FieldKind::Text {
                return Err(mismatch("text"));
            }
            Predicate::Text(tokenize(value))
        }
        "range" => {
            if kind != FieldKind::Numeric {
                return Err(mismatch("numeric"));
            }
            let [min, max] = split_exact::<2>(name, value, "min,max")?;
            let (min, max) = (parse_number(name, min)?, parse_number(name, max)?);
            if min > max {
                return Err(BlobError::invalid_value(name, "range minimum exceeds maximum"));
            }
            Predicate::Range { min, max }
        }
        "time" => {
            if kind != FieldKind::Time {
                return Err(mismatch("time"));
            }
            let [start, end] = split_exact::<2>(name, value, "start,end")?;
            let (start, end) = (parse_time(name, start)?, parse_time(name, end)?);
            if start > end {
                return Err(BlobError::invalid_value(name, "time range start is after end"));
            }
            Predicate::Time { start, end }
        }
        "geo" => {
            if kind != FieldKind::Text {
                return Err(mismatch("text"));
            }
            let [lon, lat, distance] = split_exact::<3>(name, value, "lon,lat,distance")?;
            let center = GeoPoint::new(parse_number(name, lon)?, parse_number(name, lat)?)
                .ok_or_else(|| BlobError::invalid_value(name, "coordinates out of range"))?;
            let radius_m = parse_distance(distance)
                .ok_or_else(|| BlobError::invalid_value(name, format!("invalid distance `{}`", distance)))?;
            Predicate::Geo { center, radius_m }
        }
        _ => return Err(unsupported()),
    };
    Ok(Condition { field, predicate })
}

fn split_exact<'a, const N: usize>(field: &str, value: &'a str, shape: &str) -> BlobResult<[&'a str; N]> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    parts
        .try_into()
        .map_err(|_| BlobError::invalid_value(field, format!("expected `{}`", shape)))
}

fn parse_number(field: &str, value: &str) -> BlobResult<f64> {
    match value.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        Ok(_) => Err(BlobError::invalid_value(field, format!("`{}` is not finite", value))),
        Err(err) => Err(BlobError::invalid_value(field, format!("`{}`: {}", value, err))),
    }
}

fn parse_flag(field: &str, value: &str) -> BlobResult<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(BlobError::invalid_value(field, format!("`{}` is not a boolean", other))),
    }
}

fn parse_time(field: &str, value: &str) -> BlobResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| BlobError::invalid_value(field, format!("`{}`: {}", value, err)))
}

/// Parse a distance such as `500`, `1.5km` or `3 mi` into meters.
pub fn parse_distance(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let amount: f64 = value[..split].trim().parse().ok()?;
    let factor = match value[split..].trim().to_ascii_lowercase().as_str() {
        "" | "m" => 1.0,
        "mm" => 0.001,
        "cm" => 0.01,
        "km" => 1000.0,
        "in" => 0.0254,
        "ft" => 0.3048,
        "yd" => 0.9144,
        "mi" => 1609.344,
        "nm" => 1852.0,
        _ => return None,
    };
    (amount.is_finite() && amount >= 0.0).then_some(amount * factor)
}

/// Split text into deduplicated lowercase alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Option<Self> {
        ((-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)).then_some(Self { lon, lat })
    }

    /// Parse a stored `lon,lat` field value in plain decimal notation.
    pub fn parse(value: &str) -> Option<Self> {
        if !value.chars().all(|c| matches!(c, '0'..='9' | '-' | '+' | '.' | ',' | ' ')) {
            return None;
        }
        let (lon, lat) = value.split_once(',')?;
        Self::new(lon.trim().parse().ok()?, lat.trim().parse().ok()?)
    }

    /// Equirectangular distance in meters, scaled at this point's latitude.
    ///
    /// The relational store evaluates the same formula in SQL, so both stores
    /// agree on which points fall inside a radius.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let x = (other.lon - self.lon) * self.lat.to_radians().cos();
        let y = other.lat - self.lat;
        (x * x + y * y).sqrt() * METERS_PER_DEGREE
    }
}
