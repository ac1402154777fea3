use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

use crate::server::allocator::AuthorityConfig;

/// Runtime configuration for the `ginkgo-id-metaserver` binary.
///
/// All values come from CLI arguments or environment variables (a `.env` file
/// is loaded first), with defaults suitable for a single-replica deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ginkgo-id-metaserver",
    version,
    about = "Leases id segments and snowflake machine ids to ginkgo-id generators"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// JSON snapshot holding the allocation records. Without it records live
    /// in memory only and every restart hands out ids from zero again, which
    /// is only safe for tests.
    ///
    /// Environment variable: `STORE_PATH`
    #[arg(long, env = "STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Optimistic attempts per allocation before answering 409.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[arg(long, env = "MAX_RETRIES", default_value_t = AuthorityConfig::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Pause between allocation attempts, in milliseconds.
    ///
    /// Environment variable: `RETRY_BACKOFF_MS`
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 5)]
    pub retry_backoff_ms: u64,

    /// Segment size used when a request does not name one.
    ///
    /// Environment variable: `DEFAULT_STEP`
    #[arg(long, env = "DEFAULT_STEP", default_value_t = ginkgo_id_meta_core::DEFAULT_STEP)]
    pub default_step: i64,

    /// Seconds to let in-flight requests finish after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub store_path: Option<PathBuf>,
    pub authority: AuthorityConfig,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_retries == 0 {
            bail!("MAX_RETRIES must be greater than 0");
        }

        if args.default_step <= 0 {
            bail!("DEFAULT_STEP must be greater than 0, got {}", args.default_step);
        }

        if args.retry_backoff_ms > 10_000 {
            bail!(
                "RETRY_BACKOFF_MS ({}) would hold the biz tag lock for too long (max = 10000)",
                args.retry_backoff_ms
            );
        }

        if let Some(path) = args.store_path.as_deref().filter(|path| path.is_dir()) {
            bail!("STORE_PATH ({}) must be a file, not a directory", path.display());
        }

        Ok(Self {
            server_addr: args.server_addr,
            store_path: args.store_path,
            authority: AuthorityConfig {
                max_retries: args.max_retries,
                retry_backoff: Duration::from_millis(args.retry_backoff_ms),
                default_step: args.default_step,
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
