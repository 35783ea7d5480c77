//! Lift ride events and their validation.
//!
//! An [`Event`] is built once at ingress from the request path and JSON body,
//! travels through the queue as JSON, and is turned into a [`RideRecord`] by
//! the batch writer. Events are never mutated after validation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Inclusive bounds for `resortID`.
pub const RESORT_ID_RANGE: (i32, i32) = (1, 10);

/// The only season currently accepted.
pub const ACCEPTED_SEASON: i32 = 2025;

/// Inclusive bounds for `dayID`.
pub const DAY_ID_RANGE: (i32, i32) = (1, 366);

/// Inclusive bounds for `skierID`.
pub const SKIER_ID_RANGE: (i32, i32) = (1, 100_000);

/// Inclusive bounds for the ride `time` (minutes into the day).
pub const TIME_RANGE: (i32, i32) = (1, 360);

/// Inclusive bounds for `liftID`.
pub const LIFT_ID_RANGE: (i32, i32) = (1, 40);

/// Vertical metres credited per lift number.
const VERTICAL_PER_LIFT: i32 = 10;

/// A validated lift ride.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "skierID")]
    pub skier_id: i32,
    #[serde(rename = "resortID")]
    pub resort_id: i32,
    #[serde(rename = "seasonID")]
    pub season_id: String,
    #[serde(rename = "dayID")]
    pub day_id: String,
    #[serde(rename = "liftID")]
    pub lift_id: i32,
    pub time: i32,
}

impl Event {
    /// Serialize the event into its queue payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an event from a queue payload.
    ///
    /// Payloads are produced by the gateway after validation, so no range
    /// checks are repeated here.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// The storage record this event maps to.
    pub fn to_record(&self) -> RideRecord {
        RideRecord::from(self)
    }
}

/// Raw path segments of `/skiers/{resortID}/seasons/{seasonID}/days/{dayID}/skiers/{skierID}`.
#[derive(Debug, Clone, Copy)]
pub struct RidePath<'a> {
    pub resort_id: &'a str,
    pub season_id: &'a str,
    pub day_id: &'a str,
    pub skier_id: &'a str,
}

/// JSON body of a ride submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiftRide {
    pub time: Option<i32>,
    #[serde(rename = "liftID")]
    pub lift_id: Option<i32>,
}

/// Validate a ride submission and build the [`Event`] it describes.
///
/// # Errors
///
/// Returns [`Error::InvalidField`] for any unparsable or out-of-range value,
/// [`Error::MissingBody`] for an empty body and [`Error::Json`] for a body
/// that isn't a JSON object of the expected shape.
pub fn validate_ride(path: RidePath<'_>, body: &[u8]) -> Result<Event> {
    let resort_id = parse_bounded("resortID", path.resort_id, RESORT_ID_RANGE)?;
    let season_id = parse_int("seasonID", path.season_id)?;
    if season_id != ACCEPTED_SEASON {
        return Err(Error::invalid_field(
            "seasonID",
            format!("must be {}", ACCEPTED_SEASON),
        ));
    }
    let day_id = parse_bounded("dayID", path.day_id, DAY_ID_RANGE)?;
    let skier_id = parse_bounded("skierID", path.skier_id, SKIER_ID_RANGE)?;

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::MissingBody);
    }
    let ride: LiftRide = serde_json::from_slice(body)?;
    let time = check_bounded("time", ride.time, TIME_RANGE)?;
    let lift_id = check_bounded("liftID", ride.lift_id, LIFT_ID_RANGE)?;

    Ok(Event {
        skier_id,
        resort_id,
        season_id: season_id.to_string(),
        day_id: day_id.to_string(),
        lift_id,
        time,
    })
}

fn parse_int(field: &'static str, raw: &str) -> Result<i32> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| Error::invalid_field(field, format!("'{}' is not a valid integer", raw)))
}

fn parse_bounded(field: &'static str, raw: &str, range: (i32, i32)) -> Result<i32> {
    let value = parse_int(field, raw)?;
    check_bounded(field, Some(value), range)
}

fn check_bounded(field: &'static str, value: Option<i32>, (min, max): (i32, i32)) -> Result<i32> {
    match value {
        Some(v) if (min..=max).contains(&v) => Ok(v),
        Some(v) => Err(Error::invalid_field(
            field,
            format!("{} is not between {} and {}", v, min, max),
        )),
        None => Err(Error::invalid_field(field, "is required")),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Storage record
// ═══════════════════════════════════════════════════════════════════════════

/// Primary key of a stored ride.
///
/// Derived purely from event content, so redelivered events land on the
/// same key and overwrite instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RideKey {
    pub skier_id: i32,
    pub season_day_time: String,
}

/// A ride as persisted by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideRecord {
    pub skier_id: i32,
    /// `"{season}-{day}-{time}"`, the sort key.
    pub season_day_time: String,
    pub resort_id: i32,
    pub lift_id: i32,
    pub time: i32,
    pub vertical_gain: i32,
    /// `"{resort}-{season}-{day}"`, for per-resort daily lookups.
    pub resort_season_day: String,
}

impl RideRecord {
    /// The idempotency key of this record.
    pub fn key(&self) -> RideKey {
        RideKey {
            skier_id: self.skier_id,
            season_day_time: self.season_day_time.clone(),
        }
    }
}

impl From<&Event> for RideRecord {
    fn from(event: &Event) -> Self {
        Self {
            skier_id: event.skier_id,
            season_day_time: format!("{}-{}-{}", event.season_id, event.day_id, event.time),
            resort_id: event.resort_id,
            lift_id: event.lift_id,
            time: event.time,
            vertical_gain: event.lift_id * VERTICAL_PER_LIFT,
            resort_season_day: format!("{}-{}-{}", event.resort_id, event.season_id, event.day_id),
        }
    }
}
