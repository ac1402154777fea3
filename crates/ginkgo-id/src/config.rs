use core::time::Duration;

use crate::{Error, Result, SegmentOptions, SnowflakeOptions};

/// Which id strategy an [`IdGenerator`](crate::IdGenerator) runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GeneratorKind {
    #[default]
    Snowflake,
    Segment,
}

/// Client-side generator configuration.
///
/// With the `serde` feature it reads from camelCase documents, with every
/// field optional:
///
/// ```json
/// {
///   "kind": "segment",
///   "snowflake": { "bizTag": "order", "bufferSize": 1048576, "fillBatchSize": 16384, "maxIdleTime": 5000 },
///   "segment": { "bizTag": "order", "step": 10000, "ringSize": 8 }
/// }
/// ```
///
/// Only the section selected by `kind` is validated and used.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    pub snowflake: SnowflakeConfig,
    pub segment: SegmentConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SnowflakeConfig {
    /// Business tag the machine id is leased under.
    pub biz_tag: String,
    pub buffer_size: usize,
    pub fill_batch_size: usize,
    /// Serialized as milliseconds.
    #[cfg_attr(feature = "serde", serde(with = "crate::as_millis"))]
    pub max_idle_time: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SegmentConfig {
    /// Business tag segments are leased under.
    pub biz_tag: String,
    pub step: i64,
    pub ring_size: usize,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            biz_tag: String::new(),
            buffer_size: SnowflakeOptions::DEFAULT_BUFFER_SIZE,
            fill_batch_size: SnowflakeOptions::DEFAULT_FILL_BATCH_SIZE,
            max_idle_time: SnowflakeOptions::DEFAULT_MAX_IDLE_TIME,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            biz_tag: String::new(),
            step: SegmentOptions::DEFAULT_STEP,
            ring_size: SegmentOptions::DEFAULT_RING_SIZE,
        }
    }
}

impl SnowflakeConfig {
    pub fn options(&self) -> SnowflakeOptions {
        SnowflakeOptions::new(self.buffer_size, self.fill_batch_size, self.max_idle_time)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] or [`Error::InvalidRingSize`] for the
    /// first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.biz_tag.is_empty() {
            return Err(Error::invalid_config("snowflake.bizTag must not be empty"));
        }
        self.options().validate()
    }
}

impl SegmentConfig {
    pub fn options(&self) -> SegmentOptions {
        SegmentOptions::new(self.step, self.ring_size)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] or [`Error::InvalidRingSize`] for the
    /// first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.biz_tag.is_empty() {
            return Err(Error::invalid_config("segment.bizTag must not be empty"));
        }
        self.options().validate()
    }
}

impl GeneratorConfig {
    /// Validates the section selected by [`Self::kind`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] or [`Error::InvalidRingSize`].
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            GeneratorKind::Snowflake => self.snowflake.validate(),
            GeneratorKind::Segment => self.segment.validate(),
        }
    }
}
