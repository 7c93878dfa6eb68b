use serde::Deserialize;
use std::path::PathBuf;

/// Client configuration. The external configurator owns parsing and
/// merging; this struct is its delivery format, with environment-variable
/// overrides for the named options so tests and launch scripts can tweak a
/// client without a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Cap on the local file-id table (`client.max_files`).
    pub max_files: usize,
    /// Coalesce writes through a segment tree (`client.flatten_writes`).
    pub flatten_writes: bool,
    /// Track all local extents to short-circuit reads
    /// (`client.local_extents`).
    pub local_extents: bool,
    /// Bytes of the superblock write-index region
    /// (`client.write_index_size`).
    pub write_index_size: usize,
    /// Bytes of the receive shared-memory region (`client.recv_data_size`).
    pub recv_data_size: usize,
    /// Backing-store root directory (`logio.spill_dir`).
    pub spill_dir: PathBuf,
    /// Slice size for cross-rank metadata and data requests
    /// (`meta.range_size`).
    pub meta_range_size: usize,
    /// Log threshold, an `EnvFilter` directive (`log.verbosity`).
    pub log_verbosity: String,
    /// Endpoint of the co-located server, `unix:<path>` or `host:port`.
    /// Defaults to the well-known socket under the spill directory.
    pub server_addr: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_files: 128,
            flatten_writes: true,
            local_extents: false,
            write_index_size: 1024 * 1024,
            recv_data_size: 4 * 1024 * 1024,
            spill_dir: PathBuf::from("/var/tmp/shoal"),
            meta_range_size: 1024 * 1024,
            log_verbosity: "info".to_string(),
            server_addr: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by any `SHOAL_*` environment variables present.
    pub fn from_env() -> ClientConfig {
        let mut cfg = ClientConfig::default();

        if let Some(v) = env_parse("SHOAL_CLIENT_MAX_FILES") {
            cfg.max_files = v;
        }
        if let Some(v) = env_parse("SHOAL_CLIENT_FLATTEN_WRITES") {
            cfg.flatten_writes = v;
        }
        if let Some(v) = env_parse("SHOAL_CLIENT_LOCAL_EXTENTS") {
            cfg.local_extents = v;
        }
        if let Some(v) = env_parse("SHOAL_CLIENT_WRITE_INDEX_SIZE") {
            cfg.write_index_size = v;
        }
        if let Some(v) = env_parse("SHOAL_CLIENT_RECV_DATA_SIZE") {
            cfg.recv_data_size = v;
        }
        if let Ok(v) = std::env::var("SHOAL_LOGIO_SPILL_DIR") {
            cfg.spill_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("SHOAL_META_RANGE_SIZE") {
            cfg.meta_range_size = v;
        }
        if let Ok(v) = std::env::var("SHOAL_LOG_VERBOSITY") {
            cfg.log_verbosity = v;
        }
        if let Ok(v) = std::env::var("SHOAL_SERVER_ADDR") {
            cfg.server_addr = Some(v);
        }

        cfg
    }

    /// Where to dial the co-located server.
    pub fn server_addr(&self) -> String {
        match &self.server_addr {
            Some(addr) => addr.clone(),
            None => format!("unix:{}", self.spill_dir.join("shoald.sock").display()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_server_addr_lives_under_the_spill_dir() {
        let cfg = ClientConfig {
            spill_dir: PathBuf::from("/mnt/fast"),
            ..Default::default()
        };
        assert_eq!(cfg.server_addr(), "unix:/mnt/fast/shoald.sock");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"max_files": 64, "local_extents": true}"#).unwrap();
        assert_eq!(cfg.max_files, 64);
        assert!(cfg.local_extents);
        assert!(cfg.flatten_writes);
    }
}
