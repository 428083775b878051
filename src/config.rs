//! Profile configuration: an optional TOML file merged with command-line flags.
//!
//! ```toml
//! functions = ["parse", "Lexer:next_token"]
//! algorithm = "trie"
//! cpu = true
//! memory = false
//! root = true
//! pin_cpu = 2
//! frame_limit = 4096
//! ```

use std::path::{Path, PathBuf};

use callmeter_runtime::{Algorithm, Config, FunctionKey, DEFAULT_FRAME_LIMIT};

use crate::error::Error;

/// Contents of a profile file. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileFile {
    pub functions: Vec<String>,
    pub algorithm: Option<String>,
    pub cpu: Option<bool>,
    pub memory: Option<bool>,
    pub root: Option<bool>,
    pub pin_cpu: Option<usize>,
    pub frame_limit: Option<usize>,
}

impl ProfileFile {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values given on the command line. Boolean flags can only switch a
/// measurement on; scalar flags replace the file's value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Overrides {
    pub functions: Vec<String>,
    pub algorithm: Option<Algorithm>,
    pub cpu: bool,
    pub memory: bool,
    pub root: bool,
    pub pin_cpu: Option<usize>,
    pub frame_limit: Option<usize>,
}

/// Merge file and flags into an engine configuration. Functions from the file
/// come first, in file order, followed by those given with `--fn`.
pub fn resolve(file: Option<ProfileFile>, overrides: &Overrides) -> Result<Config, Error> {
    let file = file.unwrap_or_default();

    let tracked_functions = file
        .functions
        .iter()
        .chain(&overrides.functions)
        .map(|key| FunctionKey::parse(key))
        .collect::<Result<Vec<_>, _>>()?;
    if tracked_functions.is_empty() {
        return Err(Error::NoFunctions);
    }

    let algorithm = match (overrides.algorithm, file.algorithm.as_deref()) {
        (Some(algorithm), _) => algorithm,
        (None, Some(name)) => name.parse().map_err(Error::InvalidConfig)?,
        (None, None) => Algorithm::default(),
    };

    let frame_limit = overrides
        .frame_limit
        .or(file.frame_limit)
        .unwrap_or(DEFAULT_FRAME_LIMIT);
    if frame_limit == 0 {
        return Err(Error::InvalidConfig("frame_limit must be at least 1".into()));
    }

    Ok(Config {
        tracked_functions,
        algorithm,
        measure_cpu: overrides.cpu || file.cpu.unwrap_or(false),
        measure_memory: overrides.memory || file.memory.unwrap_or(false),
        track_root: overrides.root || file.root.unwrap_or(false),
        pin_cpu: overrides.pin_cpu.or(file.pin_cpu),
        frame_limit,
    })
}

/// Where runs are stored: `CALLMETER_RUNS_DIR`, else `target/callmeter/runs`
/// under the current directory.
pub fn runs_dir() -> PathBuf {
    match std::env::var_os("CALLMETER_RUNS_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from("target/callmeter/runs"),
    }
}
