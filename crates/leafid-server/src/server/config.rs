use core::time::Duration;
use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use leafid::{SegmentConfig, WorkerIdConfig, snowflake::MAX_WORKER_ID};

/// Which strategy serves ids for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Ranges reserved from the `leaf_alloc` table, one buffer per key.
    Segment,
    /// Time-ordered ids; the key is ignored.
    Snowflake,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Runtime configuration for the `leafid-server` binary.
///
/// Every flag can also be given through the environment (a `.env` file in the
/// working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "leafid-server",
    version,
    about = "An HTTP service handing out segment or Snowflake ids"
)]
pub struct CliArgs {
    /// Id generation strategy.
    ///
    /// Environment variable: `LEAF_MODE`
    #[arg(long, env = "LEAF_MODE", value_enum, default_value_t = Mode::Segment)]
    pub mode: Mode,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Route serving ids.
    ///
    /// Environment variable: `REQUEST_PATH`
    #[arg(long, env = "REQUEST_PATH", default_value_t = String::from("/api/id"))]
    pub request_path: String,

    /// Query parameter carrying the key.
    ///
    /// Environment variable: `QUERY_PARAM`
    #[arg(long, env = "QUERY_PARAM", default_value_t = String::from("key"))]
    pub query_param: String,

    /// PostgreSQL connection strings, comma separated. Requests are spread
    /// across all reachable ones.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL", value_delimiter = ',')]
    pub database_url: Vec<String>,

    /// Pool size per database.
    ///
    /// Environment variable: `DB_MAX_CONNECTIONS`
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Create the `leaf_alloc` table on startup if it is missing.
    ///
    /// Environment variable: `RUN_MIGRATIONS`
    #[arg(long, env = "RUN_MIGRATIONS", default_value_t = false)]
    pub run_migrations: bool,

    /// Directory for segment snapshots written on shutdown. Defaults to
    /// `<tmp>/leafid/segments`.
    ///
    /// Environment variable: `SEGMENT_CACHE_DIR`
    #[arg(long, env = "SEGMENT_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Seconds between key-set resyncs against the database.
    ///
    /// Environment variable: `RESYNC_INTERVAL_SECS`
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 60)]
    pub resync_interval_secs: u64,

    /// Fixed Snowflake worker id. Without it the id cached by the last
    /// coordinated registration is used.
    ///
    /// Environment variable: `WORKER_ID`
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<i64>,

    /// Root of the worker-id cache. Defaults to the system temp directory.
    ///
    /// Environment variable: `WORKER_CACHE_DIR`
    #[arg(long, env = "WORKER_CACHE_DIR")]
    pub worker_cache_dir: Option<PathBuf>,

    /// Service name namespacing the worker-id cache.
    ///
    /// Environment variable: `LEAF_NAME`
    #[arg(long, env = "LEAF_NAME", default_value_t = String::from("leaf"))]
    pub leaf_name: String,

    /// Snowflake epoch in Unix milliseconds. `0`, negative or future values
    /// select the built-in default.
    ///
    /// Environment variable: `SNOWFLAKE_EPOCH`
    #[arg(long, env = "SNOWFLAKE_EPOCH", default_value_t = 0, allow_negative_numbers = true)]
    pub epoch_ms: i64,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub enum GeneratorConfig {
    Segment {
        database_urls: Vec<String>,
        max_connections: u32,
        run_migrations: bool,
        segment: SegmentConfig,
    },
    Snowflake {
        epoch_ms: i64,
        worker_id: Option<i64>,
        worker: WorkerIdConfig,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: SocketAddr,
    pub request_path: String,
    pub query_param: String,
    pub log_format: LogFormat,
    pub generator: GeneratorConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let server_addr: SocketAddr = args
            .server_addr
            .parse()
            .with_context(|| format!("SERVER_ADDR `{}` is not a socket address", args.server_addr))?;

        if !args.request_path.starts_with('/') {
            bail!("REQUEST_PATH must start with `/`, got `{}`", args.request_path);
        }
        if args.query_param.is_empty() {
            bail!("QUERY_PARAM must not be empty");
        }

        let generator = match args.mode {
            Mode::Segment => {
                let database_urls: Vec<String> = args
                    .database_url
                    .into_iter()
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty())
                    .collect();
                if database_urls.is_empty() {
                    bail!("segment mode requires at least one DATABASE_URL");
                }
                if args.max_connections == 0 {
                    bail!("DB_MAX_CONNECTIONS must be greater than 0");
                }
                if args.resync_interval_secs == 0 {
                    bail!("RESYNC_INTERVAL_SECS must be greater than 0");
                }
                let cache_dir = args
                    .cache_dir
                    .unwrap_or_else(|| std::env::temp_dir().join("leafid").join("segments"));
                GeneratorConfig::Segment {
                    database_urls,
                    max_connections: args.max_connections,
                    run_migrations: args.run_migrations,
                    segment: SegmentConfig::new(cache_dir)
                        .with_resync_interval(Duration::from_secs(args.resync_interval_secs)),
                }
            }
            Mode::Snowflake => {
                if let Some(worker_id) = args.worker_id {
                    if !(0..=MAX_WORKER_ID).contains(&worker_id) {
                        bail!(
                            "WORKER_ID ({}) is outside the Snowflake worker id space [0, {}]",
                            worker_id,
                            MAX_WORKER_ID
                        );
                    }
                }
                let mut worker = WorkerIdConfig::new(args.leaf_name, server_addr.port());
                if let Some(dir) = args.worker_cache_dir {
                    worker.cache_dir = dir;
                }
                GeneratorConfig::Snowflake {
                    epoch_ms: args.epoch_ms,
                    worker_id: args.worker_id,
                    worker,
                }
            }
        };

        Ok(Self {
            server_addr,
            request_path: args.request_path,
            query_param: args.query_param,
            log_format: args.log_format,
            generator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: [&str; 6] = [
        "leafid-server",
        "--server-addr",
        "127.0.0.1:9090",
        "--request-path",
        "/api/id",
        "--query-param=key",
    ];

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(BASE.iter().chain(extra))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn segment_mode_splits_database_urls() {
        let config = parse(&[
            "--mode=segment",
            "--database-url=postgres://a/leaf,postgres://b/leaf",
            "--max-connections=4",
            "--resync-interval-secs=30",
            "--cache-dir=/var/lib/leafid",
        ])
        .unwrap();

        assert_eq!(config.server_addr.port(), 9090);
        match config.generator {
            GeneratorConfig::Segment {
                database_urls,
                max_connections,
                segment,
                ..
            } => {
                assert_eq!(database_urls, ["postgres://a/leaf", "postgres://b/leaf"]);
                assert_eq!(max_connections, 4);
                assert_eq!(segment.cache_dir, PathBuf::from("/var/lib/leafid"));
                assert_eq!(segment.resync_interval, Duration::from_secs(30));
            }
            other => panic!("unexpected generator config: {other:?}"),
        }
    }

    #[test]
    fn segment_mode_needs_a_database() {
        let err = parse(&["--mode=segment", "--database-url="]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn snowflake_worker_cache_follows_listen_port() {
        let config = parse(&[
            "--mode=snowflake",
            "--worker-id=12",
            "--leaf-name=orders",
            "--worker-cache-dir=/var/cache",
            "--epoch-ms=-1",
        ])
        .unwrap();

        match config.generator {
            GeneratorConfig::Snowflake {
                epoch_ms,
                worker_id,
                worker,
            } => {
                assert_eq!(epoch_ms, -1);
                assert_eq!(worker_id, Some(12));
                assert_eq!(
                    worker.cache_file(),
                    PathBuf::from("/var/cache/orders/leafconf/9090/workerID.properties")
                );
            }
            other => panic!("unexpected generator config: {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_worker_id() {
        let err = parse(&["--mode=snowflake", "--worker-id=1024"]).unwrap_err();
        assert!(err.to_string().contains("WORKER_ID"));
    }

    #[test]
    fn rejects_relative_request_path() {
        let args = CliArgs::try_parse_from([
            "leafid-server",
            "--mode=snowflake",
            "--server-addr=127.0.0.1:9090",
            "--request-path=api/id",
            "--worker-id=1",
        ])
        .unwrap();
        assert!(ServerConfig::try_from(args).is_err());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let args = CliArgs::try_parse_from([
            "leafid-server",
            "--mode=snowflake",
            "--server-addr=localhost",
            "--request-path=/api/id",
        ])
        .unwrap();
        assert!(ServerConfig::try_from(args).is_err());
    }
}
