//! Startup configuration.
//!
//! The daemon reads a line-oriented config file at startup: `#` starts a
//! comment, words are whitespace-separated. Single-value keys set node
//! identity and daemon parameters; `node` and `volume` lines declare the
//! cluster layout. Command-line flags may override the node name and the
//! kernel device path.

use std::error;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::network::DEFAULT_PORT;

/// A peer declared in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
}

/// A volume declared in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub id: u32,
    pub name: String,
    pub mountpoint: String,
    pub master_id: u32,
    pub local_path: Option<PathBuf>,
    pub size_limit: u64,
}

/// Worker pool sizing from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub min_spare: usize,
    pub max_spare: usize,
    pub max_threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            min_spare: 2,
            max_spare: 8,
            max_threads: 16,
        }
    }
}

/// The complete startup configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub node_id: u32,
    pub node_name: String,
    pub host_name: String,
    pub kernel_device: PathBuf,
    pub listen_port: u16,
    pub default_uid: u32,
    pub default_gid: u32,
    pub metadata_tree_depth: u32,
    pub kernel_workers: WorkerConfig,
    pub network_workers: WorkerConfig,
    pub nodes: Vec<NodeConfig>,
    pub volumes: Vec<VolumeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 0,
            node_name: String::new(),
            host_name: String::new(),
            kernel_device: PathBuf::from("/dev/zfs"),
            listen_port: DEFAULT_PORT,
            default_uid: 65534,
            default_gid: 65533,
            metadata_tree_depth: 1,
            kernel_workers: WorkerConfig::default(),
            network_workers: WorkerConfig::default(),
            nodes: Vec::new(),
            volumes: Vec::new(),
        }
    }
}

/// A rejected config file.
#[derive(Debug)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "config: {}", self.message)
        } else {
            write!(f, "config line {}: {}", self.line, self.message)
        }
    }
}

impl error::Error for ConfigError {}

fn err(line: usize, message: impl Into<String>) -> ConfigError {
    ConfigError {
        line,
        message: message.into(),
    }
}

fn parse_field<T: std::str::FromStr>(
    line: usize,
    word: Option<&str>,
    what: &str,
) -> Result<T, ConfigError> {
    let word = word.ok_or_else(|| err(line, format!("missing {what}")))?;
    word.parse()
        .map_err(|_| err(line, format!("bad {what} `{word}`")))
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err(0, format!("cannot read {}: {e}", path.display())))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let mut words = content.split_whitespace();
            let key = words.next().expect("non-empty line has a first word");
            match key {
                "nodeid" => config.node_id = parse_field(line, words.next(), "node id")?,
                "nodename" => {
                    config.node_name = words
                        .next()
                        .ok_or_else(|| err(line, "missing node name"))?
                        .to_owned();
                }
                "hostname" => {
                    config.host_name = words
                        .next()
                        .ok_or_else(|| err(line, "missing host name"))?
                        .to_owned();
                }
                "device" => {
                    config.kernel_device = PathBuf::from(
                        words.next().ok_or_else(|| err(line, "missing device path"))?,
                    );
                }
                "port" => config.listen_port = parse_field(line, words.next(), "port")?,
                "defaultuid" => {
                    config.default_uid = parse_field(line, words.next(), "default uid")?;
                }
                "defaultgid" => {
                    config.default_gid = parse_field(line, words.next(), "default gid")?;
                }
                "metadatadepth" => {
                    config.metadata_tree_depth =
                        parse_field(line, words.next(), "metadata tree depth")?;
                }
                "kernelworkers" => {
                    config.kernel_workers = parse_workers(line, &mut words)?;
                }
                "networkworkers" => {
                    config.network_workers = parse_workers(line, &mut words)?;
                }
                "node" => {
                    let id = parse_field(line, words.next(), "node id")?;
                    let name = words
                        .next()
                        .ok_or_else(|| err(line, "missing node name"))?
                        .to_owned();
                    let host = words
                        .next()
                        .ok_or_else(|| err(line, "missing node host"))?
                        .to_owned();
                    config.nodes.push(NodeConfig { id, name, host });
                }
                "volume" => {
                    let id = parse_field(line, words.next(), "volume id")?;
                    let name = words
                        .next()
                        .ok_or_else(|| err(line, "missing volume name"))?
                        .to_owned();
                    let mountpoint = words
                        .next()
                        .ok_or_else(|| err(line, "missing mountpoint"))?
                        .to_owned();
                    let master_id = parse_field(line, words.next(), "master node id")?;
                    let local_path = words.next().map(PathBuf::from);
                    let size_limit = match words.next() {
                        Some(word) => parse_field(line, Some(word), "size limit")?,
                        None => 0,
                    };
                    config.volumes.push(VolumeConfig {
                        id,
                        name,
                        mountpoint,
                        master_id,
                        local_path,
                        size_limit,
                    });
                }
                other => return Err(err(line, format!("unknown keyword `{other}`"))),
            }
            if let Some(extra) = words.next() {
                return Err(err(line, format!("trailing `{extra}`")));
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(err(0, "nodename is required"));
        }
        if self.node_id == 0 {
            return Err(err(0, "nodeid is required and must be nonzero"));
        }
        for volume in &self.volumes {
            if volume.id == 0 {
                return Err(err(0, format!("volume {} has reserved id 0", volume.name)));
            }
            let master_known = volume.master_id == self.node_id
                || self.nodes.iter().any(|node| node.id == volume.master_id);
            if !master_known {
                return Err(err(
                    0,
                    format!("volume {} has unknown master {}", volume.name, volume.master_id),
                ));
            }
            if volume.master_id == self.node_id && volume.local_path.is_none() {
                return Err(err(
                    0,
                    format!("volume {} is mastered here but has no local path", volume.name),
                ));
            }
        }
        Ok(())
    }
}

fn parse_workers<'a>(
    line: usize,
    words: &mut impl Iterator<Item = &'a str>,
) -> Result<WorkerConfig, ConfigError> {
    let min_spare = parse_field(line, words.next(), "min spare")?;
    let max_spare = parse_field(line, words.next(), "max spare")?;
    let max_threads = parse_field(line, words.next(), "max threads")?;
    if min_spare == 0 || max_spare < min_spare || max_threads < max_spare {
        return Err(err(line, "worker limits must satisfy min <= max <= threads"));
    }
    Ok(WorkerConfig {
        min_spare,
        max_spare,
        max_threads,
    })
}
