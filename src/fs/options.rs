use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ChunkPolicy;
use crate::storage::chunk::Profile;

/// Parameters of a new filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Tree node size in bytes; a power of two between the sector size and
    /// 64 KiB.
    pub node_size: u32,
    /// Sector size in bytes.
    pub sector_size: u32,
    /// Filesystem label.
    pub label: String,
    /// Profile of metadata chunks.
    pub metadata_profile: Profile,
    /// Profile of data chunks.
    pub data_profile: Profile,
    /// Profile of system chunks.
    pub system_profile: Profile,
    /// Target size of metadata chunks.
    pub metadata_chunk_size: u64,
    /// Target size of data chunks.
    pub data_chunk_size: u64,
    /// Target size of system chunks.
    pub system_chunk_size: u64,
    /// Whether the new filesystem keeps free-space cache objects.
    pub space_cache: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        let policy = ChunkPolicy::default();
        Self {
            node_size: 16 * 1024,
            sector_size: 4096,
            label: String::new(),
            metadata_profile: policy.metadata,
            data_profile: policy.data,
            system_profile: policy.system,
            metadata_chunk_size: policy.metadata_chunk_size,
            data_chunk_size: policy.data_chunk_size,
            system_chunk_size: policy.system_chunk_size,
            space_cache: true,
        }
    }
}

impl FormatOptions {
    /// Options suited to small scratch images: 4 KiB nodes and single-copy
    /// chunks.
    pub fn scratch() -> Self {
        Self {
            node_size: 4096,
            metadata_profile: Profile::Single,
            system_profile: Profile::Single,
            metadata_chunk_size: 8 << 20,
            data_chunk_size: 16 << 20,
            system_chunk_size: 1 << 20,
            ..Self::default()
        }
    }

    /// Chunk policy these options describe.
    pub fn policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            metadata: self.metadata_profile,
            data: self.data_profile,
            system: self.system_profile,
            metadata_chunk_size: self.metadata_chunk_size,
            data_chunk_size: self.data_chunk_size,
            system_chunk_size: self.system_chunk_size,
            ..ChunkPolicy::default()
        }
    }
}

/// Behaviour of a mounted filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Refuse every mutation and never commit.
    pub read_only: bool,
    /// Spawn the background flusher.
    pub background_flush: bool,
    /// Interval between background commits, in milliseconds.
    pub flush_interval_ms: u64,
    /// Load free lists from cache objects when their generation matches.
    pub trust_space_cache: bool,
    /// Maintain free-space cache objects on commit.
    pub space_cache: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            background_flush: true,
            flush_interval_ms: 30_000,
            trust_space_cache: true,
            space_cache: true,
        }
    }
}

impl MountOptions {
    /// Options for tools that inspect an image without changing it.
    pub fn inspect() -> Self {
        Self {
            read_only: true,
            background_flush: false,
            ..Self::default()
        }
    }

    /// Interval between background commits.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Contents of an `arborfs` TOML configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// `[format]` table.
    pub format: FormatOptions,
    /// `[mount]` table.
    pub mount: MountOptions,
}

impl ConfigFile {
    /// Reads and parses the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }
}

/// Failure to load a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`ConfigFile`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [format]
            node_size = 4096
            metadata_profile = "raid1"

            [mount]
            flush_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.format.node_size, 4096);
        assert_eq!(cfg.format.metadata_profile, Profile::Raid1);
        assert_eq!(cfg.format.data_profile, Profile::Single);
        assert_eq!(cfg.mount.flush_interval(), Duration::from_millis(500));
        assert!(cfg.mount.background_flush);
    }

    #[test]
    fn rendered_config_parses_back() {
        let cfg = ConfigFile {
            format: FormatOptions::scratch(),
            mount: MountOptions::inspect(),
        };
        let text = cfg.to_toml().unwrap();
        assert_eq!(toml::from_str::<ConfigFile>(&text).unwrap(), cfg);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigFile::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
