//! Core domain model for CUES: raw feed rows, normalized event records,
//! tolerant date parsing, and the fixed dimension tables.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cues-core";

/// One raw row of the `culturalEventInfo` feed, decoded once at the
/// pipeline boundary. The upstream source guarantees nothing about key
/// presence, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "TITLE", default)]
    pub title: Option<String>,
    #[serde(rename = "CODENAME", default)]
    pub category: Option<String>,
    #[serde(rename = "GUNAME", default)]
    pub district: Option<String>,
    #[serde(rename = "PLACE", default)]
    pub place: Option<String>,
    #[serde(rename = "ORG_NAME", default)]
    pub organizer: Option<String>,
    #[serde(rename = "USE_TRGT", default)]
    pub audience: Option<String>,
    #[serde(rename = "USE_FEE", default)]
    pub fee: Option<String>,
    #[serde(rename = "PLAYER", default)]
    pub performers: Option<String>,
    #[serde(rename = "PROGRAM", default)]
    pub program: Option<String>,
    #[serde(rename = "ETC_DESC", default)]
    pub description: Option<String>,
    #[serde(rename = "ORG_LINK", default)]
    pub organizer_url: Option<String>,
    #[serde(rename = "MAIN_IMG", default)]
    pub image_url: Option<String>,
    #[serde(rename = "RGSTDATE", default)]
    pub registered: Option<String>,
    #[serde(rename = "TICKET", default)]
    pub ticket: Option<String>,
    #[serde(rename = "STRTDATE", default)]
    pub starts: Option<String>,
    #[serde(rename = "END_DATE", default)]
    pub ends: Option<String>,
    #[serde(rename = "THEMECODE", default)]
    pub theme_code: Option<String>,
    // The feed swaps these: LOT carries latitude, LAT carries longitude.
    #[serde(rename = "LOT", default)]
    pub lot: Option<String>,
    #[serde(rename = "LAT", default)]
    pub lat: Option<String>,
    #[serde(rename = "IS_FREE", default)]
    pub is_free: Option<String>,
    #[serde(rename = "HMPG_ADDR", default)]
    pub homepage_url: Option<String>,
}

/// Normalized form of a raw row, ready for reconciliation. Text fields
/// default to empty strings, coordinates to `0`, and the date strings are
/// parsed into timestamps or dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub title: String,
    pub place: String,
    pub organizer: String,
    pub audience: String,
    pub fee: String,
    pub performers: String,
    pub program: String,
    pub description: String,
    pub organizer_url: String,
    pub image_url: String,
    pub registered_at: Option<NaiveDateTime>,
    pub ticket: String,
    pub starts_at: Option<NaiveDateTime>,
    pub ends_at: Option<NaiveDateTime>,
    pub theme_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub is_free: String,
    pub homepage_url: String,
    pub category_label: Option<String>,
    pub district_label: Option<String>,
}

impl EventRecord {
    pub fn from_raw(raw: &RawEvent) -> Self {
        Self {
            title: text(&raw.title),
            place: text(&raw.place),
            organizer: text(&raw.organizer),
            audience: text(&raw.audience),
            fee: text(&raw.fee),
            performers: text(&raw.performers),
            program: text(&raw.program),
            description: text(&raw.description),
            organizer_url: text(&raw.organizer_url),
            image_url: text(&raw.image_url),
            registered_at: normalize_date(raw.registered.as_deref()),
            ticket: text(&raw.ticket),
            starts_at: normalize_date(raw.starts.as_deref()),
            ends_at: normalize_date(raw.ends.as_deref()),
            theme_code: text(&raw.theme_code),
            latitude: coordinate(&raw.lot),
            longitude: coordinate(&raw.lat),
            is_free: text(&raw.is_free),
            homepage_url: text(&raw.homepage_url),
            category_label: raw.category.clone(),
            district_label: raw.district.clone(),
        }
    }
}

fn text(field: &Option<String>) -> String {
    field.clone().unwrap_or_default()
}

fn coordinate(field: &Option<String>) -> f64 {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Outcome of reconciling one record against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Parse one of the feed's observed date encodings into a timestamp.
///
/// Checked in priority order: ISO-8601 with a `T` separator (a `Z` suffix is
/// read as UTC), space-separated date-time with a fractional-second tail
/// (truncated at the first `.`), space-separated date-time, bare
/// `YYYY-MM-DD`, and compact `YYYYMMDD`. Anything unparseable, including an
/// out-of-range date, is `None`: the feed's formatting has drifted over the
/// years and an unknown encoding must not fail the record.
pub fn normalize_date(raw: Option<&str>) -> Option<NaiveDateTime> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }

    if s.contains('T') {
        let candidate = s.replace('Z', "+00:00");
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&candidate) {
            return Some(parsed.naive_utc());
        }
        return NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok();
    }
    if s.contains(' ') && s.contains('.') {
        let head = s.split_once('.').map(|(head, _)| head).unwrap_or(s);
        return NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S").ok();
    }
    if s.contains(' ') {
        return NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok();
    }
    if s.contains('-') {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Which lookup dimension a label belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionKind {
    Category,
    District,
}

impl DimensionKind {
    pub fn table(self) -> &'static str {
        match self {
            DimensionKind::Category => "categories",
            DimensionKind::District => "districts",
        }
    }
}

/// Label substituted for an absent or empty dimension label.
pub const FALLBACK_LABEL: &str = "기타";

/// The sixteen pre-seeded event categories and their fixed identifiers.
pub const FIXED_CATEGORIES: &[(&str, i64)] = &[
    ("교육/체험", 1),
    ("국악", 2),
    ("독주/독창회", 3),
    ("무용", 4),
    ("뮤지컬/오페라", 5),
    ("발레", 6),
    ("샌드아트", 7),
    ("서커스/마술", 8),
    ("솔로이스트", 9),
    ("연극", 10),
    ("영화", 11),
    ("전시/미술", 12),
    ("축제", 13),
    ("클래식", 14),
    ("콘서트", 15),
    ("기타", 16),
];

/// The twenty-five Seoul districts plus the catch-all, with fixed
/// identifiers.
pub const FIXED_DISTRICTS: &[(&str, i64)] = &[
    ("강남구", 1),
    ("강동구", 2),
    ("강북구", 3),
    ("강서구", 4),
    ("관악구", 5),
    ("광진구", 6),
    ("구로구", 7),
    ("금천구", 8),
    ("노원구", 9),
    ("도봉구", 10),
    ("동대문구", 11),
    ("동작구", 12),
    ("마포구", 13),
    ("서대문구", 14),
    ("서초구", 15),
    ("성동구", 16),
    ("성북구", 17),
    ("송파구", 18),
    ("양천구", 19),
    ("영등포구", 20),
    ("용산구", 21),
    ("은평구", 22),
    ("종로구", 23),
    ("중구", 24),
    ("중랑구", 25),
    ("기타", 26),
];

/// Immutable label→id tables for the pre-seeded dimensions, built once at
/// startup and passed explicitly into resolution.
#[derive(Debug, Clone)]
pub struct FixedDimensions {
    categories: HashMap<&'static str, i64>,
    districts: HashMap<&'static str, i64>,
}

impl FixedDimensions {
    pub fn seoul() -> Self {
        Self {
            categories: FIXED_CATEGORIES.iter().copied().collect(),
            districts: FIXED_DISTRICTS.iter().copied().collect(),
        }
    }

    pub fn lookup(&self, kind: DimensionKind, label: &str) -> Option<i64> {
        match kind {
            DimensionKind::Category => self.categories.get(label).copied(),
            DimensionKind::District => self.districts.get(label).copied(),
        }
    }
}

impl Default for FixedDimensions {
    fn default() -> Self {
        Self::seoul()
    }
}
