use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Catalog of supported fasting schedules.
pub struct FastType {
    pub id: &'static str,
    pub label: &'static str,
    pub duration_hours: u32,
    pub bullets: [&'static str; 3],
}

pub const FAST_TYPES: [FastType; 5] = [
    FastType {
        id: "16_8",
        label: "16:8",
        duration_hours: 16,
        bullets: [
            "Classic daily schedule",
            "Supports insulin sensitivity",
            "Flexible eating window",
        ],
    },
    FastType {
        id: "18_6",
        label: "18:6",
        duration_hours: 18,
        bullets: [
            "Longer fat-burning window",
            "Deeper metabolic switch",
            "Appetite regulation support",
        ],
    },
    FastType {
        id: "20_4",
        label: "20:4",
        duration_hours: 20,
        bullets: [
            "Extended fasting period",
            "May enhance autophagy",
            "Requires nutrient-dense meals",
        ],
    },
    FastType {
        id: "24",
        label: "24h",
        duration_hours: 24,
        bullets: [
            "OMAD style",
            "Simplifies planning",
            "Break fast mindfully",
        ],
    },
    FastType {
        id: "36",
        label: "36h",
        duration_hours: 36,
        bullets: [
            "Occasional extended fast",
            "Hydration/electrolytes matter",
            "Break fast gently",
        ],
    },
];

pub fn fast_type(id: &str) -> Option<&'static FastType> {
    FAST_TYPES.iter().find(|t| t.id == id)
}

const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeDisplayMode {
    #[default]
    Elapsed,
    Total,
    Remaining,
}

// Field names stay camelCase on the wire so payloads written by the web
// client decrypt into the same shapes here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_fast_type_id: String,
    pub notify_on_end: bool,
    pub hourly_reminders: bool,
    pub alerts_enabled: bool,
    pub time_display_mode: TimeDisplayMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_fast_type_id: "16_8".to_string(),
            notify_on_end: true,
            hourly_reminders: true,
            alerts_enabled: false,
            time_display_mode: TimeDisplayMode::Elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveFast {
    pub id: String,
    pub type_id: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub planned_duration_hours: f64,
    pub status: String,
}

impl ActiveFast {
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.start_timestamp).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub type_id: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub duration_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reminders {
    pub end_notified: bool,
    pub last_hourly_at: Option<i64>,
}

/// The single authoritative app state. One document per user; everything in
/// here travels through the payload codec as one JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub settings: Settings,
    pub active_fast: Option<ActiveFast>,
    pub history: Vec<HistoryEntry>,
    pub reminders: Reminders,
    pub milestone_tally: BTreeMap<String, u32>,
}

/// Build an `AppState` from a decrypted payload of unknown vintage. Every
/// top-level field exists afterwards: missing fields are backfilled from
/// defaults, unknown extra fields are dropped because only named fields are
/// copied. Settings and reminders merge field-by-field.
pub fn merge_with_defaults(raw: &Value) -> AppState {
    let mut merged = AppState::default();

    if let Some(settings) = raw.get("settings").and_then(Value::as_object) {
        if let Some(v) = settings.get("defaultFastTypeId").and_then(Value::as_str) {
            merged.settings.default_fast_type_id = v.to_string();
        }
        if let Some(v) = settings.get("notifyOnEnd").and_then(Value::as_bool) {
            merged.settings.notify_on_end = v;
        }
        if let Some(v) = settings.get("hourlyReminders").and_then(Value::as_bool) {
            merged.settings.hourly_reminders = v;
        }
        if let Some(v) = settings.get("alertsEnabled").and_then(Value::as_bool) {
            merged.settings.alerts_enabled = v;
        }
        if let Some(v) = settings.get("timeDisplayMode") {
            if let Ok(mode) = serde_json::from_value::<TimeDisplayMode>(v.clone()) {
                merged.settings.time_display_mode = mode;
            }
        }
    }

    if let Some(af) = raw.get("activeFast") {
        merged.active_fast = serde_json::from_value::<ActiveFast>(af.clone()).ok();
    }

    if let Some(history) = raw.get("history").and_then(Value::as_array) {
        merged.history = history
            .iter()
            .filter_map(|e| serde_json::from_value::<HistoryEntry>(e.clone()).ok())
            .collect();
    }

    if let Some(reminders) = raw.get("reminders").and_then(Value::as_object) {
        if let Some(v) = reminders.get("endNotified").and_then(Value::as_bool) {
            merged.reminders.end_notified = v;
        }
        if let Some(v) = reminders.get("lastHourlyAt") {
            merged.reminders.last_hourly_at = v.as_i64();
        }
    }

    if let Some(tally) = raw.get("milestoneTally").and_then(Value::as_object) {
        for (k, v) in tally {
            if let Some(n) = v.as_u64() {
                merged.milestone_tally.insert(k.clone(), n as u32);
            }
        }
    }

    merged
}

/// Events produced by the reminder tick. The caller decides how to surface
/// them; this layer never shows UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderFire {
    GoalReached,
    ExtraHour,
}

impl AppState {
    pub fn start_fast(&mut self, type_id: &str, now_ms: i64) -> anyhow::Result<&ActiveFast> {
        if self.active_fast.is_some() {
            return Err(anyhow::anyhow!("A fast is already running"));
        }
        let ft = fast_type(type_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown fast type: {}", type_id))?;

        let duration_ms = ft.duration_hours as i64 * MS_PER_HOUR;
        self.active_fast = Some(ActiveFast {
            id: format!("fast_{}", now_ms),
            type_id: ft.id.to_string(),
            start_timestamp: now_ms,
            end_timestamp: now_ms + duration_ms,
            planned_duration_hours: ft.duration_hours as f64,
            status: "active".to_string(),
        });
        self.reminders = Reminders::default();
        self.settings.default_fast_type_id = ft.id.to_string();
        Ok(self.active_fast.as_ref().unwrap())
    }

    /// End the running fast. `early` ends at `now`; otherwise the entry is
    /// logged at the planned end. A fast that reached its planned end bumps
    /// the milestone tally for its type.
    pub fn finish_fast(&mut self, early: bool, now_ms: i64) -> Option<HistoryEntry> {
        let af = self.active_fast.take()?;
        let end_ts = if early { now_ms } else { af.end_timestamp };
        let dur_hrs = ((end_ts - af.start_timestamp).max(0)) as f64 / MS_PER_HOUR as f64;

        let entry = HistoryEntry {
            id: af.id.clone(),
            type_id: af.type_id.clone(),
            start_timestamp: af.start_timestamp,
            end_timestamp: end_ts,
            duration_hours: (dur_hrs * 100.0).round() / 100.0,
        };
        self.history.insert(0, entry.clone());

        if end_ts >= af.end_timestamp {
            *self.milestone_tally.entry(af.type_id).or_insert(0) += 1;
        }

        self.reminders = Reminders::default();
        Some(entry)
    }

    /// Move the start of the running fast; the end is recomputed from the
    /// planned duration and reminder tracking resets.
    pub fn edit_start_time(&mut self, new_start_ms: i64) -> anyhow::Result<()> {
        let af = self
            .active_fast
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No active fast"))?;
        let planned_ms = (af.planned_duration_hours * MS_PER_HOUR as f64) as i64;
        af.start_timestamp = new_start_ms;
        af.end_timestamp = new_start_ms + planned_ms;
        af.status = "active".to_string();
        self.reminders = Reminders::default();
        Ok(())
    }

    /// One reminder evaluation step. Fires the goal notice once at/after the
    /// planned end, then an hourly nudge while the fast runs past its goal.
    pub fn tick_reminders(&mut self, now_ms: i64) -> Option<ReminderFire> {
        let af = self.active_fast.as_ref()?;
        if !self.settings.alerts_enabled {
            return None;
        }
        let end_ts = af.end_timestamp;

        if !self.reminders.end_notified && now_ms >= end_ts {
            self.reminders.end_notified = true;
            self.reminders.last_hourly_at = Some(now_ms);
            if self.settings.notify_on_end {
                return Some(ReminderFire::GoalReached);
            }
            return None;
        }

        if self.reminders.end_notified && self.settings.hourly_reminders {
            let last = self.reminders.last_hourly_at.unwrap_or(end_ts);
            if now_ms - last >= MS_PER_HOUR {
                self.reminders.last_hourly_at = Some(now_ms);
                return Some(ReminderFire::ExtraHour);
            }
        }

        None
    }
}

/// Local-date key (`YYYY-MM-DD`) for a millisecond timestamp. Calendar
/// grouping and note day-keys both use this.
pub fn date_key(ts_ms: i64) -> String {
    match Local.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => "1970-01-01".to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaySummary {
    pub entries: Vec<HistoryEntry>,
    pub total_hours: f64,
}

/// Group history entries by the local date of their start timestamp.
pub fn day_fast_map(history: &[HistoryEntry]) -> BTreeMap<String, DaySummary> {
    let mut map: BTreeMap<String, DaySummary> = BTreeMap::new();
    for e in history {
        let summary = map.entry(date_key(e.start_timestamp)).or_default();
        summary.total_hours += e.duration_hours;
        summary.entries.push(e.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_backfills_missing_fields() {
        let raw = json!({
            "settings": { "defaultFastTypeId": "24", "alertsEnabled": true },
            "history": [],
        });
        let merged = merge_with_defaults(&raw);
        assert_eq!(merged.settings.default_fast_type_id, "24");
        assert!(merged.settings.alerts_enabled);
        // Backfilled from defaults
        assert!(merged.settings.notify_on_end);
        assert!(merged.active_fast.is_none());
        assert!(!merged.reminders.end_notified);
        assert!(merged.milestone_tally.is_empty());
    }

    #[test]
    fn merge_drops_unknown_fields_and_is_idempotent() {
        let raw = json!({
            "settings": { "hourlyReminders": false, "legacyField": 42 },
            "futureTopLevel": { "x": 1 },
            "reminders": { "endNotified": true, "lastHourlyAt": 123 },
        });
        let once = merge_with_defaults(&raw);
        let twice = merge_with_defaults(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, twice);
        assert!(once.reminders.end_notified);
        assert_eq!(once.reminders.last_hourly_at, Some(123));
    }

    #[test]
    fn start_and_finish_fast() {
        let mut state = AppState::default();
        let now = 1_700_000_000_000;
        state.start_fast("16_8", now).unwrap();

        let af = state.active_fast.as_ref().unwrap();
        assert_eq!(af.id, format!("fast_{}", now));
        assert_eq!(af.end_timestamp, now + 16 * MS_PER_HOUR);

        assert!(state.start_fast("24", now).is_err());

        // Ended two hours in
        let entry = state.finish_fast(true, now + 2 * MS_PER_HOUR).unwrap();
        assert_eq!(entry.duration_hours, 2.0);
        assert!(state.active_fast.is_none());
        assert_eq!(state.history.len(), 1);
        // Early end never counts as a milestone
        assert!(state.milestone_tally.is_empty());
    }

    #[test]
    fn completed_fast_bumps_milestone_tally() {
        let mut state = AppState::default();
        let now = 1_700_000_000_000;
        state.start_fast("16_8", now).unwrap();
        state.finish_fast(false, now + 17 * MS_PER_HOUR).unwrap();
        assert_eq!(state.milestone_tally.get("16_8"), Some(&1));
        // Logged at the planned end, not at `now`
        assert_eq!(state.history[0].duration_hours, 16.0);
    }

    #[test]
    fn duration_rounds_to_two_decimals() {
        let mut state = AppState::default();
        let now = 0;
        state.start_fast("16_8", now).unwrap();
        // 1h 20m 30s
        let entry = state.finish_fast(true, 4_830_000).unwrap();
        assert_eq!(entry.duration_hours, 1.34);
    }

    #[test]
    fn edit_start_recomputes_end_and_resets_reminders() {
        let mut state = AppState::default();
        state.start_fast("18_6", 1_000_000).unwrap();
        state.reminders.end_notified = true;

        state.edit_start_time(2_000_000).unwrap();
        let af = state.active_fast.as_ref().unwrap();
        assert_eq!(af.start_timestamp, 2_000_000);
        assert_eq!(af.end_timestamp, 2_000_000 + 18 * MS_PER_HOUR);
        assert!(!state.reminders.end_notified);
    }

    #[test]
    fn reminder_sequence() {
        let mut state = AppState::default();
        state.settings.alerts_enabled = true;
        let start = 0;
        state.start_fast("16_8", start).unwrap();
        let end = 16 * MS_PER_HOUR;

        assert_eq!(state.tick_reminders(end - 1), None);
        assert_eq!(state.tick_reminders(end), Some(ReminderFire::GoalReached));
        // Only once
        assert_eq!(state.tick_reminders(end + 1), None);
        assert_eq!(
            state.tick_reminders(end + MS_PER_HOUR),
            Some(ReminderFire::ExtraHour)
        );
        assert_eq!(state.tick_reminders(end + MS_PER_HOUR + 1), None);
    }

    #[test]
    fn reminders_respect_settings() {
        let mut state = AppState::default();
        state.settings.alerts_enabled = true;
        state.settings.notify_on_end = false;
        state.start_fast("16_8", 0).unwrap();
        let end = 16 * MS_PER_HOUR;

        // Goal notice suppressed, but tracking still advances
        assert_eq!(state.tick_reminders(end), None);
        assert!(state.reminders.end_notified);
    }

    #[test]
    fn day_map_groups_by_start_date() {
        let mut history = Vec::new();
        let base = 1_700_000_000_000;
        history.push(HistoryEntry {
            id: "a".into(),
            type_id: "16_8".into(),
            start_timestamp: base,
            end_timestamp: base + MS_PER_HOUR,
            duration_hours: 1.0,
        });
        history.push(HistoryEntry {
            id: "b".into(),
            type_id: "24".into(),
            start_timestamp: base + MS_PER_HOUR,
            end_timestamp: base + 3 * MS_PER_HOUR,
            duration_hours: 2.0,
        });
        let map = day_fast_map(&history);
        let day = map.get(&date_key(base)).unwrap();
        assert_eq!(day.entries.len(), 2);
        assert_eq!(day.total_hours, 3.0);
    }
}
