mod lifecycle;
mod provider;
mod segment;
mod snowflake;
mod worker;

#[cfg(test)]
mod tests;

pub use lifecycle::LifecycleState;
pub use provider::*;
pub use segment::*;
pub use snowflake::*;
pub(crate) use worker::StopSignal;
#[cfg(test)]
pub(crate) use worker::BackgroundWorker;

use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{GeneratorConfig, GeneratorKind, Result};

/// A configured id generator of either strategy.
///
/// Built from a [`GeneratorConfig`] so the strategy can be picked at
/// deployment time without touching call sites.
#[derive(Debug)]
pub enum IdGenerator {
    Segment(SegmentIdGenerator<Arc<dyn SegmentProvider>>),
    Snowflake(SnowflakeIdGenerator),
}

impl IdGenerator {
    /// Builds the generator selected by `config.kind`.
    ///
    /// The segment strategy keeps `provider` for refills. The snowflake
    /// strategy uses it once, to lease its machine id.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::InvalidConfig`] / [`crate::Error::InvalidRingSize`] if `config`
    ///   does not validate
    /// - [`crate::Error::Allocation`] if a snowflake machine id cannot be leased
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(kind = ?config.kind)))]
    pub fn from_config<P>(config: &GeneratorConfig, provider: Arc<P>) -> Result<Self>
    where
        P: SegmentProvider + MachineIdProvider + 'static,
    {
        config.validate()?;
        match config.kind {
            GeneratorKind::Segment => {
                let segment = &config.segment;
                let provider: Arc<dyn SegmentProvider> = provider;
                SegmentIdGenerator::with_options(provider, segment.biz_tag.as_str(), segment.options())
                    .map(Self::Segment)
            }
            GeneratorKind::Snowflake => {
                let snowflake = &config.snowflake;
                SnowflakeIdGenerator::from_provider(&*provider, &snowflake.biz_tag, snowflake.options())
                    .map(Self::Snowflake)
            }
        }
    }

    pub const fn kind(&self) -> GeneratorKind {
        match self {
            Self::Segment(_) => GeneratorKind::Segment,
            Self::Snowflake(_) => GeneratorKind::Snowflake,
        }
    }

    /// # Errors
    ///
    /// - [`crate::Error::Closed`] if already shut down
    /// - [`crate::Error::Spawn`] if the background thread could not be created
    pub fn start(&self) -> Result<()> {
        match self {
            Self::Segment(generator) => generator.start(),
            Self::Snowflake(generator) => generator.start(),
        }
    }

    /// Returns the next id, waiting while the buffer is empty.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::NotStarted`] before [`Self::start`]
    /// - [`crate::Error::Closed`] after [`Self::shutdown`]
    #[inline]
    pub fn next_id(&self) -> Result<i64> {
        match self {
            Self::Segment(generator) => generator.next_id(),
            Self::Snowflake(generator) => generator.next_id(),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Self::Segment(generator) => generator.shutdown(),
            Self::Snowflake(generator) => generator.shutdown(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self {
            Self::Segment(generator) => generator.state(),
            Self::Snowflake(generator) => generator.state(),
        }
    }
}

impl From<SegmentIdGenerator<Arc<dyn SegmentProvider>>> for IdGenerator {
    fn from(generator: SegmentIdGenerator<Arc<dyn SegmentProvider>>) -> Self {
        Self::Segment(generator)
    }
}

impl From<SnowflakeIdGenerator> for IdGenerator {
    fn from(generator: SnowflakeIdGenerator) -> Self {
        Self::Snowflake(generator)
    }
}
