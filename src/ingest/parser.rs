//! Streaming export parsing and normalization.
//!
//! This module decodes the (potentially multi-GB) health export XML into
//! typed records, one logical unit at a time, so peak memory stays constant
//! regardless of file size. It drives `quick-xml` in a forgiving mode:
//! a malformed fragment is skipped and counted, never aborting the job.
//!
//! # Recognized elements
//!
//! - **`<Record>`**: split by type-identifier prefix into quantity samples
//!   (`HKQuantityTypeIdentifier*`) and category events
//!   (`HKCategoryTypeIdentifier*`). Unknown record types are skipped.
//! - **`<Workout>`**: one record per workout, including nested
//!   `<MetadataEntry>` key/value pairs and `<WorkoutRoute>/<Location>`
//!   route points.
//! - **`<ActivitySummary>`**: one row per day of activity-ring totals.
//!
//! # Normalization
//!
//! - Timestamps use the export's `2024-01-01 08:00:00 -0500` format and are
//!   converted to UTC.
//! - Energy is stored in kJ, distance in meters, duration in seconds.
//! - Type identifiers lose their `HK*` prefixes; raw category value
//!   constants get a human-readable label.
//! - NUL bytes are stripped from attribute text (PostgreSQL cannot store
//!   them).
//!
//! # Error handling
//!
//! Field-level problems (unparseable timestamp, missing value, unknown
//! type) skip the record. XML-level errors from the reader are also
//! recoverable as long as the reader keeps advancing; a stalled position or
//! an I/O failure is fatal and fails the whole job. The skip counter is
//! drained by the producer and reaches the import ledger with the batch
//! that carries it.

use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::BufRead;
use thiserror::Error;
use uuid::Uuid;

const QUANTITY_PREFIX: &str = "HKQuantityTypeIdentifier";
const CATEGORY_PREFIX: &str = "HKCategoryTypeIdentifier";
const WORKOUT_PREFIX: &str = "HKWorkoutActivityType";
const CATEGORY_VALUE_PREFIX: &str = "HKCategoryValue";

const KCAL_TO_KJ: f64 = 4.184;
const KM_TO_M: f64 = 1_000.0;
const MI_TO_M: f64 = 1_609.344;
const MIN_TO_SEC: f64 = 60.0;
const HR_TO_SEC: f64 = 3_600.0;

/// Namespace for deterministic workout ids: the v5 UUID of the dedup key
/// `(user_id, start_time, activity_type)`. Re-importing the same workout
/// regenerates the same id, so route points always resolve to the row that
/// actually exists after conflict-skipping.
const WORKOUT_ID_NS: Uuid = Uuid::from_u128(0xa1b2_c3d4_e5f6_7890_abcd_ef12_3456_7890_u128);

/// Exporting device/app, resolved to a `data_sources` row by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub name: String,
    pub bundle_id: Option<String>,
    pub device_info: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub source: Option<SourceRef>,
}

#[derive(Debug, Clone)]
pub struct CategoryRecord {
    pub time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub category_type: String,
    pub value: String,
    pub value_label: Option<String>,
    pub source: Option<SourceRef>,
}

#[derive(Debug, Clone)]
pub struct RoutePointRecord {
    pub time: DateTime<Utc>,
    pub workout_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct WorkoutRecord {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub activity_type: String,
    pub duration_sec: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub total_energy_kj: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub source: Option<SourceRef>,
    pub route: Vec<RoutePointRecord>,
}

#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub date: NaiveDate,
    pub active_energy_burned_kj: Option<f64>,
    pub active_energy_goal_kj: Option<f64>,
    pub exercise_minutes: Option<f64>,
    pub exercise_goal_minutes: Option<f64>,
    pub stand_hours: Option<i32>,
    pub stand_goal_hours: Option<i32>,
}

/// One fully decoded logical unit of the export.
#[derive(Debug, Clone)]
pub enum ParsedRecord {
    Sample(SampleRecord),
    Category(CategoryRecord),
    Workout(WorkoutRecord),
    Summary(SummaryRecord),
}

/// Conditions the parser cannot recover from.
#[derive(Debug, Error)]
pub enum ParseFatal {
    #[error("export stream error: {0}")]
    Read(quick_xml::Error),
    #[error("parser stalled at byte {position}: {source}")]
    Stalled {
        position: u64,
        source: quick_xml::Error,
    },
}

enum RawElement {
    Record(HashMap<String, String>),
    Workout(HashMap<String, String>),
    WorkoutEmpty(HashMap<String, String>),
    Summary(HashMap<String, String>),
    Other,
    Eof,
    Malformed(quick_xml::Error),
}

pub struct ExportParser<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    user_id: i32,
    skipped: u64,
    last_error_pos: Option<u64>,
}

impl<R: BufRead> ExportParser<R> {
    pub fn new(source: R, user_id: i32) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);

        Self {
            reader,
            buf: Vec::new(),
            user_id,
            skipped: 0,
            last_error_pos: None,
        }
    }

    /// Drain the count of fragments skipped since the previous drain.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Advance to the next decodable record. `Ok(None)` is end of input.
    pub fn next_record(&mut self) -> Result<Option<ParsedRecord>, ParseFatal> {
        loop {
            let element = self.read_element();

            match element {
                RawElement::Eof => return Ok(None),
                RawElement::Record(attrs) => match self.record_from_attrs(&attrs) {
                    Some(record) => return Ok(Some(record)),
                    None => self.skipped += 1,
                },
                RawElement::Workout(attrs) => {
                    let (metadata, locations) = self.collect_workout_children()?;
                    match self.workout_from_attrs(&attrs, metadata, locations) {
                        Some(workout) => return Ok(Some(ParsedRecord::Workout(workout))),
                        None => self.skipped += 1,
                    }
                }
                RawElement::WorkoutEmpty(attrs) => {
                    match self.workout_from_attrs(&attrs, Vec::new(), Vec::new()) {
                        Some(workout) => return Ok(Some(ParsedRecord::Workout(workout))),
                        None => self.skipped += 1,
                    }
                }
                RawElement::Summary(attrs) => match summary_from_attrs(&attrs) {
                    Some(summary) => return Ok(Some(ParsedRecord::Summary(summary))),
                    None => self.skipped += 1,
                },
                RawElement::Malformed(err) => self.note_reader_error(err)?,
                RawElement::Other => {}
            }
        }
    }

    fn read_element(&mut self) -> RawElement {
        self.buf.clear();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Eof) => RawElement::Eof,
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"Record" => RawElement::Record(attr_map(&e)),
                b"Workout" => RawElement::Workout(attr_map(&e)),
                b"ActivitySummary" => RawElement::Summary(attr_map(&e)),
                _ => RawElement::Other,
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"Record" => RawElement::Record(attr_map(&e)),
                b"Workout" => RawElement::WorkoutEmpty(attr_map(&e)),
                b"ActivitySummary" => RawElement::Summary(attr_map(&e)),
                _ => RawElement::Other,
            },
            Ok(_) => RawElement::Other,
            Err(e) => RawElement::Malformed(e),
        }
    }

    /// Gather `<MetadataEntry>` and `<Location>` children up to the closing
    /// `</Workout>` tag. Malformed children are skipped like any other
    /// fragment.
    #[allow(clippy::type_complexity)]
    fn collect_workout_children(
        &mut self,
    ) -> Result<(Vec<(String, String)>, Vec<HashMap<String, String>>), ParseFatal> {
        let mut metadata = Vec::new();
        let mut locations = Vec::new();

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Eof) => break,
                Ok(Event::End(e)) if e.name().as_ref() == b"Workout" => break,
                Ok(Event::Empty(e)) | Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"MetadataEntry" => {
                        let attrs = attr_map(&e);
                        if let Some(key) = attrs.get("key") {
                            let value = attrs.get("value").cloned().unwrap_or_default();
                            metadata.push((key.clone(), value));
                        }
                    }
                    b"Location" => locations.push(attr_map(&e)),
                    _ => {}
                },
                Ok(_) => {}
                Err(e) => self.note_reader_error(e)?,
            }
        }

        Ok((metadata, locations))
    }

    /// Tolerate a reader error as long as the reader keeps moving; a
    /// repeated position means no forward progress is possible.
    fn note_reader_error(&mut self, err: quick_xml::Error) -> Result<(), ParseFatal> {
        if matches!(err, quick_xml::Error::Io(_)) {
            return Err(ParseFatal::Read(err));
        }

        let position = self.reader.buffer_position() as u64;
        if self.last_error_pos == Some(position) {
            return Err(ParseFatal::Stalled {
                position,
                source: err,
            });
        }

        log::debug!("skipping malformed fragment at byte {}: {}", position, err);
        self.last_error_pos = Some(position);
        self.skipped += 1;
        Ok(())
    }

    fn record_from_attrs(&self, attrs: &HashMap<String, String>) -> Option<ParsedRecord> {
        let record_type = attrs.get("type").map(String::as_str).unwrap_or("");
        let time = parse_export_timestamp(attrs.get("startDate")?)?;
        let end_time = attrs.get("endDate").and_then(|s| parse_export_timestamp(s));
        let source = source_from_attrs(attrs);

        if let Some(metric_type) = record_type.strip_prefix(QUANTITY_PREFIX) {
            let value = safe_float(attrs.get("value"))?;
            return Some(ParsedRecord::Sample(SampleRecord {
                time,
                end_time,
                metric_type: metric_type.to_string(),
                value,
                unit: attrs.get("unit").cloned().unwrap_or_default(),
                source,
            }));
        }

        if let Some(category_type) = record_type.strip_prefix(CATEGORY_PREFIX) {
            let value = attrs.get("value").cloned().unwrap_or_default();
            let value_label = clean_category_value(&value);
            return Some(ParsedRecord::Category(CategoryRecord {
                time,
                end_time,
                category_type: category_type.to_string(),
                value,
                value_label,
                source,
            }));
        }

        // Unknown record type
        None
    }

    fn workout_from_attrs(
        &self,
        attrs: &HashMap<String, String>,
        metadata: Vec<(String, String)>,
        locations: Vec<HashMap<String, String>>,
    ) -> Option<WorkoutRecord> {
        let start_time = parse_export_timestamp(attrs.get("startDate")?)?;
        let end_time = attrs.get("endDate").and_then(|s| parse_export_timestamp(s));

        let activity_type = clean_type_name(
            attrs.get("workoutActivityType").map(String::as_str).unwrap_or(""),
            WORKOUT_PREFIX,
        );

        let id = workout_id(self.user_id, start_time, &activity_type);

        let duration_sec = convert_duration_sec(
            safe_float(attrs.get("duration")),
            attrs.get("durationUnit").map(String::as_str).unwrap_or("min"),
        );
        let total_distance_m = convert_distance_m(
            safe_float(attrs.get("totalDistance")),
            attrs.get("totalDistanceUnit").map(String::as_str).unwrap_or("km"),
        );
        let total_energy_kj = convert_energy_kj(
            safe_float(attrs.get("totalEnergyBurned")),
            attrs
                .get("totalEnergyBurnedUnit")
                .map(String::as_str)
                .unwrap_or("kcal"),
        );

        let metadata = if metadata.is_empty() {
            None
        } else {
            let map: serde_json::Map<String, serde_json::Value> = metadata
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            Some(serde_json::Value::Object(map))
        };

        let route = locations
            .iter()
            .filter_map(|loc| {
                let time = parse_export_timestamp(loc.get("date")?)?;
                let latitude = safe_float(loc.get("latitude"))?;
                let longitude = safe_float(loc.get("longitude"))?;
                Some(RoutePointRecord {
                    time,
                    workout_id: id,
                    latitude,
                    longitude,
                    altitude_m: safe_float(loc.get("altitude")),
                })
            })
            .collect();

        Some(WorkoutRecord {
            id,
            start_time,
            end_time,
            activity_type,
            duration_sec,
            total_distance_m,
            total_energy_kj,
            metadata,
            source: source_from_attrs(attrs),
            route,
        })
    }
}

fn summary_from_attrs(attrs: &HashMap<String, String>) -> Option<SummaryRecord> {
    let date = NaiveDate::parse_from_str(attrs.get("dateComponents")?.trim(), "%Y-%m-%d").ok()?;

    let energy_unit = attrs
        .get("activeEnergyBurnedUnit")
        .map(String::as_str)
        .unwrap_or("kcal");

    Some(SummaryRecord {
        date,
        active_energy_burned_kj: convert_energy_kj(
            safe_float(attrs.get("activeEnergyBurned")),
            energy_unit,
        ),
        active_energy_goal_kj: convert_energy_kj(
            safe_float(attrs.get("activeEnergyBurnedGoal")),
            energy_unit,
        ),
        exercise_minutes: safe_float(attrs.get("appleExerciseTime")),
        exercise_goal_minutes: safe_float(attrs.get("appleExerciseTimeGoal")),
        stand_hours: safe_int(attrs.get("appleStandHours")),
        stand_goal_hours: safe_int(attrs.get("appleStandHoursGoal")),
    })
}

/// Read attributes tolerantly: malformed escapes fall back to the literal
/// bytes rather than dropping the record, and NUL bytes are stripped so
/// values remain storable.
fn attr_map(e: &BytesStart<'_>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for attr in e.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        map.insert(key, sanitize_text(&value));
    }
    map
}

/// Strip NUL bytes that PostgreSQL cannot store.
fn sanitize_text(text: &str) -> String {
    if text.contains('\0') {
        text.replace('\0', "").trim().to_string()
    } else {
        text.trim().to_string()
    }
}

fn source_from_attrs(attrs: &HashMap<String, String>) -> Option<SourceRef> {
    let name = attrs.get("sourceName")?.clone();
    if name.is_empty() {
        return None;
    }
    Some(SourceRef {
        name,
        // sourceVersion is the closest stable analog of a bundle id the
        // export carries.
        bundle_id: attrs.get("sourceVersion").cloned(),
        device_info: attrs.get("device").cloned(),
    })
}

/// Parse the export timestamp format `2024-01-01 08:00:00 -0500` into UTC.
pub(crate) fn parse_export_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn clean_type_name(raw: &str, prefix: &str) -> String {
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

/// Derive a human-readable label from a raw category value constant:
/// `HKCategoryValueSleepAnalysisAsleepDeep` -> `Sleep Analysis Asleep Deep`.
fn clean_category_value(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    let stripped = raw.strip_prefix(CATEGORY_VALUE_PREFIX).unwrap_or(raw);

    let mut label = String::with_capacity(stripped.len() + 4);
    let mut prev_lower = false;
    for c in stripped.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            label.push(' ');
        }
        prev_lower = c.is_ascii_lowercase();
        label.push(c);
    }

    Some(label)
}

fn safe_float(value: Option<&String>) -> Option<f64> {
    value.and_then(|s| s.trim().parse::<f64>().ok())
}

fn safe_int(value: Option<&String>) -> Option<i32> {
    value.and_then(|s| s.trim().parse::<i32>().ok())
}

fn convert_energy_kj(value: Option<f64>, unit: &str) -> Option<f64> {
    let value = value?;
    match unit.trim().to_ascii_lowercase().as_str() {
        "kcal" | "cal" => Some(value * KCAL_TO_KJ),
        "kj" => Some(value),
        other => {
            log::debug!("unknown energy unit {:?}; storing raw value", other);
            Some(value)
        }
    }
}

fn convert_distance_m(value: Option<f64>, unit: &str) -> Option<f64> {
    let value = value?;
    match unit.trim().to_ascii_lowercase().as_str() {
        "km" => Some(value * KM_TO_M),
        "mi" | "mile" | "miles" => Some(value * MI_TO_M),
        "m" | "meter" | "meters" => Some(value),
        other => {
            log::debug!("unknown distance unit {:?}; storing raw value", other);
            Some(value)
        }
    }
}

fn convert_duration_sec(value: Option<f64>, unit: &str) -> Option<f64> {
    let value = value?;
    match unit.trim().to_ascii_lowercase().as_str() {
        "min" | "minute" | "minutes" => Some(value * MIN_TO_SEC),
        "hr" | "hour" | "hours" => Some(value * HR_TO_SEC),
        "s" | "sec" | "second" | "seconds" => Some(value),
        other => {
            log::debug!("unknown duration unit {:?}; storing raw value", other);
            Some(value)
        }
    }
}

/// Deterministic workout id from the dedup key.
pub(crate) fn workout_id(user_id: i32, start_time: DateTime<Utc>, activity_type: &str) -> Uuid {
    let key = format!("{}:{}:{}", user_id, start_time.to_rfc3339(), activity_type);
    Uuid::new_v5(&WORKOUT_ID_NS, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_all(xml: &str) -> (Vec<ParsedRecord>, u64) {
        let mut parser = ExportParser::new(Cursor::new(xml.as_bytes().to_vec()), 1);
        let mut records = Vec::new();
        while let Some(record) = parser.next_record().expect("no fatal error") {
            records.push(record);
        }
        (records, parser.take_skipped())
    }

    #[test]
    fn parses_export_timestamp_with_offset() {
        let parsed = parse_export_timestamp("2024-01-01 08:00:00 -0500").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T13:00:00+00:00");
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_export_timestamp("not-a-date").is_none());
        assert!(parse_export_timestamp("2024-01-01").is_none());
    }

    #[test]
    fn converts_units() {
        assert_eq!(convert_energy_kj(Some(1.0), "kcal"), Some(KCAL_TO_KJ));
        assert_eq!(convert_energy_kj(Some(2.5), "kJ"), Some(2.5));
        assert_eq!(convert_distance_m(Some(2.0), "km"), Some(2_000.0));
        assert_eq!(convert_distance_m(Some(1.0), "mi"), Some(MI_TO_M));
        assert_eq!(convert_duration_sec(Some(1.5), "min"), Some(90.0));
        assert_eq!(convert_duration_sec(Some(2.0), "hr"), Some(7_200.0));
        assert_eq!(convert_duration_sec(None, "min"), None);
    }

    #[test]
    fn cleans_category_values() {
        assert_eq!(
            clean_category_value("HKCategoryValueSleepAnalysisAsleepDeep").as_deref(),
            Some("Sleep Analysis Asleep Deep")
        );
        assert_eq!(
            clean_category_value("HKCategoryValueAppleStandHourStood").as_deref(),
            Some("Apple Stand Hour Stood")
        );
        assert_eq!(clean_category_value(""), None);
    }

    #[test]
    fn workout_id_is_deterministic() {
        let start = parse_export_timestamp("2024-03-01 07:00:00 +0000").unwrap();
        assert_eq!(workout_id(1, start, "Running"), workout_id(1, start, "Running"));
        assert_ne!(workout_id(1, start, "Running"), workout_id(2, start, "Running"));
        assert_ne!(workout_id(1, start, "Running"), workout_id(1, start, "Cycling"));
    }

    #[test]
    fn parses_samples_categories_and_summaries() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData locale="en_US">
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Watch" sourceVersion="10.2"
         unit="count" value="523" startDate="2024-01-01 08:00:00 -0500" endDate="2024-01-01 08:10:00 -0500"/>
 <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Watch"
         value="HKCategoryValueSleepAnalysisAsleepDeep"
         startDate="2024-01-01 01:00:00 -0500" endDate="2024-01-01 02:00:00 -0500"/>
 <ActivitySummary dateComponents="2024-01-01" activeEnergyBurned="400" activeEnergyBurnedUnit="kcal"
         activeEnergyBurnedGoal="500" appleExerciseTime="32" appleStandHours="10"/>
</HealthData>"#;

        let (records, skipped) = parse_all(xml);
        assert_eq!(skipped, 0);
        assert_eq!(records.len(), 3);

        match &records[0] {
            ParsedRecord::Sample(s) => {
                assert_eq!(s.metric_type, "StepCount");
                assert_eq!(s.value, 523.0);
                assert_eq!(s.unit, "count");
                let source = s.source.as_ref().unwrap();
                assert_eq!(source.name, "Watch");
                assert_eq!(source.bundle_id.as_deref(), Some("10.2"));
            }
            other => panic!("expected sample, got {other:?}"),
        }

        match &records[1] {
            ParsedRecord::Category(c) => {
                assert_eq!(c.category_type, "SleepAnalysis");
                assert_eq!(c.value_label.as_deref(), Some("Sleep Analysis Asleep Deep"));
            }
            other => panic!("expected category event, got {other:?}"),
        }

        match &records[2] {
            ParsedRecord::Summary(s) => {
                assert_eq!(s.date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
                assert_eq!(s.active_energy_burned_kj, Some(400.0 * KCAL_TO_KJ));
                assert_eq!(s.stand_hours, Some(10));
                assert_eq!(s.stand_goal_hours, None);
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn parses_workout_with_metadata_and_route() {
        let xml = r#"<HealthData>
 <Workout workoutActivityType="HKWorkoutActivityTypeRunning" duration="30" durationUnit="min"
          totalDistance="5" totalDistanceUnit="km" totalEnergyBurned="300" totalEnergyBurnedUnit="kcal"
          sourceName="Watch" startDate="2024-02-01 07:00:00 +0000" endDate="2024-02-01 07:30:00 +0000">
  <MetadataEntry key="HKWeatherTemperature" value="12 degC"/>
  <WorkoutRoute sourceName="Watch">
   <Location date="2024-02-01 07:01:00 +0000" latitude="51.5" longitude="-0.1" altitude="12.5"/>
   <Location date="2024-02-01 07:02:00 +0000" latitude="51.6" longitude="-0.2"/>
  </WorkoutRoute>
 </Workout>
</HealthData>"#;

        let (records, skipped) = parse_all(xml);
        assert_eq!(skipped, 0);
        assert_eq!(records.len(), 1);

        match &records[0] {
            ParsedRecord::Workout(w) => {
                assert_eq!(w.activity_type, "Running");
                assert_eq!(w.duration_sec, Some(1_800.0));
                assert_eq!(w.total_distance_m, Some(5_000.0));
                assert_eq!(w.total_energy_kj, Some(300.0 * KCAL_TO_KJ));
                assert_eq!(w.route.len(), 2);
                assert_eq!(w.route[0].workout_id, w.id);
                assert_eq!(w.route[0].altitude_m, Some(12.5));
                assert_eq!(w.route[1].altitude_m, None);

                let metadata = w.metadata.as_ref().unwrap();
                assert_eq!(metadata["HKWeatherTemperature"], "12 degC");
            }
            other => panic!("expected workout, got {other:?}"),
        }
    }

    #[test]
    fn skips_malformed_records_and_continues() {
        let xml = r#"<HealthData>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="10"
         startDate="not-a-real-date"/>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="abc"
         startDate="2024-01-01 08:00:00 +0000"/>
 <Record type="HKSomethingUnrecognized" value="1" startDate="2024-01-01 08:00:00 +0000"/>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="42"
         startDate="2024-01-01 09:00:00 +0000"/>
</HealthData>"#;

        let (records, skipped) = parse_all(xml);
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 3);
        match &records[0] {
            ParsedRecord::Sample(s) => assert_eq!(s.value, 42.0),
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn recovers_from_stray_close_tag() {
        let xml = r#"<HealthData>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="1"
         startDate="2024-01-01 08:00:00 +0000"/>
 </Workout>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="2"
         startDate="2024-01-01 09:00:00 +0000"/>
</HealthData>"#;

        let (records, skipped) = parse_all(xml);
        assert_eq!(records.len(), 2);
        assert!(skipped >= 1);
    }

    #[test]
    fn tolerates_unescaped_ampersand_in_attribute() {
        let xml = r#"<HealthData>
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Tom & Jerry" unit="count"
         value="7" startDate="2024-01-01 08:00:00 +0000"/>
</HealthData>"#;

        let (records, _) = parse_all(xml);
        assert_eq!(records.len(), 1);
        match &records[0] {
            ParsedRecord::Sample(s) => assert_eq!(s.value, 7.0),
            other => panic!("expected sample, got {other:?}"),
        }
    }
}
