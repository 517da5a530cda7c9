//! Per-instance configuration, stored as `instance.conf` next to the
//! instance's backup directories.

use camino::Utf8PathBuf;
use tracing::warn;
use wal_meta::seg_size::DEFAULT_XLOG_SEG_SIZE;
use wal_meta::WalSegSize;

use crate::config;
use crate::{CatalogConf, INSTANCE_CONFIG_FILE};

/// Knobs of one database instance tracked by the catalog.
#[derive(Clone, Debug)]
pub struct InstanceConfig {
    pub name: String,
    /// Data directory of the instance, when registered.
    pub pgdata: Option<Utf8PathBuf>,
    /// WAL segment geometry the instance was initialized with.
    pub wal_seg_size: WalSegSize,
    /// How many valid backups per timeline must stay PITR-capable.
    /// Zero or negative disables WAL retention.
    pub wal_depth: i32,
}

impl InstanceConfig {
    pub fn new(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            pgdata: None,
            wal_seg_size: WalSegSize::default(),
            wal_depth: 0,
        }
    }

    /// Read `instance.conf` of a registered instance. A missing file leaves
    /// the defaults in place; that is common right after registration.
    pub fn load(conf: &CatalogConf, name: &str) -> anyhow::Result<InstanceConfig> {
        let mut instance = InstanceConfig::new(name);
        let path = conf.instance_dir(name).join(INSTANCE_CONFIG_FILE);
        if !path.exists() {
            warn!("Instance config {path:?} doesn't exist, using defaults");
            return Ok(instance);
        }

        let mut seg_size_bytes = DEFAULT_XLOG_SEG_SIZE;
        for option in config::read_kv_file(&path)? {
            let option = match option {
                Ok(option) => option,
                Err(line) => {
                    warn!("Syntax error in {path:?}: \"{line}\"");
                    continue;
                }
            };
            let key = option.key.as_str();
            let value = option.value.as_str();

            if config::key_matches(key, "pgdata") {
                instance.pgdata = Some(Utf8PathBuf::from(value));
            } else if config::key_matches(key, "xlog-seg-size") {
                match value.trim().parse::<u64>() {
                    Ok(bytes) => seg_size_bytes = bytes,
                    Err(_) => warn!("Invalid xlog-seg-size \"{value}\" in {path:?}"),
                }
            } else if config::key_matches(key, "wal-depth") {
                match value.trim().parse::<i32>() {
                    Ok(depth) => instance.wal_depth = depth,
                    Err(_) => warn!("Invalid wal-depth \"{value}\" in {path:?}"),
                }
            } else {
                warn!("Unknown option \"{key}\" in {path:?}");
            }
        }

        instance.wal_seg_size = WalSegSize::from_bytes(seg_size_bytes)?;
        Ok(instance)
    }
}
