//! JSON shapes exchanged with the allocation authority.
//!
//! All bodies are camelCase. Timestamps use `yyyy-MM-dd HH:mm:ss` in the
//! authority's local time.

use chrono::NaiveDateTime;
use ginkgo_id::Segment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const NEXT_MACHINE_ID_PATH: &str = "/next-machine-id";
pub const NEXT_SEGMENT_PATH: &str = "/next-segment";
pub const HEALTH_PATH: &str = "/health";

/// Step used when a segment request does not carry one.
pub const DEFAULT_STEP: i64 = 1_000;

/// A machine id leased to one snowflake generator instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowflakeNodeDto {
    pub id: i64,
    pub biz_tag: String,
    pub machine_id: i64,
    #[serde(with = "datetime")]
    pub create_time: NaiveDateTime,
    #[serde(with = "datetime")]
    pub update_time: NaiveDateTime,
}

/// A leased id range: `[next_id, next_id + step - 1]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetaDto {
    pub id: i64,
    pub biz_tag: String,
    pub next_id: i64,
    pub step: i64,
    #[serde(with = "datetime")]
    pub create_time: NaiveDateTime,
    #[serde(with = "datetime")]
    pub update_time: NaiveDateTime,
}

impl SegmentMetaDto {
    /// The range this response leases.
    ///
    /// # Errors
    ///
    /// [`ginkgo_id::Error::InvalidSegment`] if `step <= 0` or the range
    /// overflows.
    pub fn segment(&self) -> ginkgo_id::Result<Segment> {
        Segment::from_step(self.next_id, self.step)
    }
}

/// Query of `/next-machine-id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdQuery {
    pub biz_tag: String,
}

/// Query of `/next-segment`. A missing `step` means the authority's default,
/// [`DEFAULT_STEP`] unless configured otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentQuery {
    pub biz_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
}

/// Body of every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// Checks that `biz_tag` names something. Tags are otherwise opaque and
/// percent-encoded on the wire.
///
/// # Errors
///
/// [`Error::InvalidRequest`] for an empty tag.
pub fn validate_biz_tag(biz_tag: &str) -> Result<()> {
    if biz_tag.is_empty() {
        return Err(Error::invalid_request("bizTag must not be empty"));
    }
    Ok(())
}

/// `yyyy-MM-dd HH:mm:ss` (de)serialization for [`NaiveDateTime`].
pub mod datetime {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(D::Error::custom)
    }
}
