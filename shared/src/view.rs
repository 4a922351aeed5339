//! Pure derivations the presentation layer renders from published state.

use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::UtcOffset;

use crate::model::{parse_timestamp, IncidentRecord, UnixTimeMs, Urgency};

const ABSOLUTE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");
const CLOCK_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

const SHORT_ID_LEN: usize = 8;

// ============================================================================
// Truncation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated<'a, T> {
    pub shown: &'a [T],
    pub elided: usize,
}

impl<T> Truncated<'_, T> {
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.elided > 0
    }
}

/// First `n` items plus the number left out.
#[must_use]
pub fn truncate<T>(items: &[T], n: usize) -> Truncated<'_, T> {
    let cut = n.min(items.len());
    Truncated {
        shown: &items[..cut],
        elided: items.len() - cut,
    }
}

/// Symptom tags for a table cell: the first `n`, and a `+k` overflow label
/// when more exist.
#[must_use]
pub fn symptom_chips(symptoms: &[String], n: usize) -> (&[String], Option<String>) {
    let Truncated { shown, elided } = truncate(symptoms, n);
    (shown, (elided > 0).then(|| format!("+{elided}")))
}

// ============================================================================
// Urgency Styling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyStyle {
    Critical,
    Elevated,
    Standard,
}

impl UrgencyStyle {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Elevated => "elevated",
            Self::Standard => "standard",
        }
    }

    #[must_use]
    pub const fn color_hex(self) -> &'static str {
        match self {
            Self::Critical => "#ef4444",
            Self::Elevated => "#f97316",
            Self::Standard => "#eab308",
        }
    }
}

/// Shared by the map, grid and feed. Unrecognised labels render as standard.
#[must_use]
pub const fn urgency_style(urgency: &Urgency) -> UrgencyStyle {
    match urgency {
        Urgency::Critical => UrgencyStyle::Critical,
        Urgency::High => UrgencyStyle::Elevated,
        Urgency::Standard | Urgency::Low | Urgency::Other(_) => UrgencyStyle::Standard,
    }
}

// ============================================================================
// Time Formatting
// ============================================================================

#[must_use]
pub fn format_time_ago(timestamp_ms: u64, now_ms: u64) -> String {
    if timestamp_ms > now_ms {
        let future_diff_secs = (timestamp_ms - now_ms) / 1000;
        return if future_diff_secs < 60 {
            "Just now".into()
        } else {
            "Upcoming".into()
        };
    }

    let diff_secs = (now_ms - timestamp_ms) / 1000;
    if diff_secs < 5 {
        return "Just now".into();
    }
    if diff_secs < 60 {
        return format!("{diff_secs}s ago");
    }

    let diff_mins = diff_secs / 60;
    if diff_mins < 60 {
        return format!("{diff_mins}m ago");
    }

    let diff_hours = diff_mins / 60;
    if diff_hours < 24 {
        return format!("{diff_hours}h ago");
    }

    let diff_days = diff_hours / 24;
    if diff_days < 7 {
        return format!("{diff_days}d ago");
    }
    if diff_days < 30 {
        return format!("{}w ago", diff_days / 7);
    }
    if diff_days < 365 {
        return format!("{}mo ago", diff_days / 30);
    }
    format!("{}y ago", diff_days / 365)
}

/// Relative age of an ISO-8601 value. Unparseable input is returned as is.
#[must_use]
pub fn format_relative(raw: &str, now: UnixTimeMs) -> String {
    parse_timestamp(raw).map_or_else(
        || raw.to_string(),
        |dt| format_time_ago(UnixTimeMs::from_datetime(dt).as_millis(), now.as_millis()),
    )
}

#[must_use]
pub fn format_absolute(raw: &str) -> String {
    format_with(raw, ABSOLUTE_FORMAT)
}

#[must_use]
pub fn format_clock(raw: &str) -> String {
    format_with(raw, CLOCK_FORMAT)
}

fn format_with(raw: &str, format: &[BorrowedFormatItem<'_>]) -> String {
    parse_timestamp(raw)
        .and_then(|dt| dt.to_offset(UtcOffset::UTC).format(format).ok())
        .unwrap_or_else(|| raw.to_string())
}

// ============================================================================
// Text
// ============================================================================

#[must_use]
pub fn short_id(id: &str) -> &str {
    id.char_indices()
        .nth(SHORT_ID_LEN)
        .map_or(id, |(end, _)| &id[..end])
}

/// Single-line preview capped at `max_len` characters, with `...` marking a
/// cut.
#[must_use]
pub fn preview_text(text: &str, max_len: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_len {
        return flat;
    }
    let mut preview: String = flat.chars().take(max_len.saturating_sub(3)).collect();
    preview.truncate(preview.trim_end().len());
    preview.push_str("...");
    preview
}

// ============================================================================
// Feed and Dashboard
// ============================================================================

/// Case-insensitive match on the report text, any symptom or the id. A blank
/// query keeps every record.
#[must_use]
pub fn filter_incidents<'a>(records: &'a [IncidentRecord], query: &str) -> Vec<&'a IncidentRecord> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return records.iter().collect();
    }
    records
        .iter()
        .filter(|record| {
            record.input_text.to_lowercase().contains(&needle)
                || record.id.as_str().to_lowercase().contains(&needle)
                || record
                    .symptoms
                    .iter()
                    .any(|s| s.to_lowercase().contains(&needle))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IncidentCounts {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    /// Standard, low and unrecognised labels.
    pub standard: usize,
    pub located: usize,
    pub unlocated: usize,
}

impl IncidentCounts {
    #[must_use]
    pub fn from_records(records: &[IncidentRecord]) -> Self {
        records.iter().fold(Self::default(), |mut counts, record| {
            counts.total += 1;
            match urgency_style(&record.urgency) {
                UrgencyStyle::Critical => counts.critical += 1,
                UrgencyStyle::Elevated => counts.high += 1,
                UrgencyStyle::Standard => counts.standard += 1,
            }
            if record.coordinate().is_some() {
                counts.located += 1;
            } else {
                counts.unlocated += 1;
            }
            counts
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedRow {
    pub id: String,
    pub short_id: String,
    pub urgency_label: String,
    pub style: UrgencyStyle,
    pub preview: String,
    pub symptoms: Vec<String>,
    pub symptom_overflow: Option<String>,
    pub received_at: String,
    pub received_ago: String,
    pub status: Option<String>,
}

impl FeedRow {
    pub const SYMPTOM_LIMIT: usize = 2;
    pub const PREVIEW_LENGTH: usize = 80;

    #[must_use]
    pub fn from_record(record: &IncidentRecord, now: UnixTimeMs) -> Self {
        Self::with_limits(record, now, Self::SYMPTOM_LIMIT, Self::PREVIEW_LENGTH)
    }

    #[must_use]
    pub fn with_limits(
        record: &IncidentRecord,
        now: UnixTimeMs,
        symptom_limit: usize,
        preview_length: usize,
    ) -> Self {
        let (symptoms, symptom_overflow) = symptom_chips(&record.symptoms, symptom_limit);
        Self {
            id: record.id.to_string(),
            short_id: short_id(record.id.as_str()).to_string(),
            urgency_label: record.urgency.as_str().to_string(),
            style: urgency_style(&record.urgency),
            preview: preview_text(&record.input_text, preview_length),
            symptoms: symptoms.to_vec(),
            symptom_overflow,
            received_at: format_clock(&record.created_at),
            received_ago: format_relative(&record.created_at, now),
            status: record
                .status
                .as_ref()
                .map(|status| status.display_name().to_string()),
        }
    }
}
