//! Output directory preparation and process launching shared by the local platform and the
//! distributed workers.

use crate::logs::LogMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;
use serde_yaml::Value;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.yaml";
pub const STDOUT_FILE: &str = "out.txt";
pub const STDERR_FILE: &str = "err.txt";

/// key injected into every persisted config so scripts know where to write
pub const OUTPUT_PATH_KEY: &str = "output_path";

static LOG_PATTERNS: Lazy<GlobSet> = Lazy::new(|| {
    let mut builder = GlobSetBuilder::new();

    for pattern in ["*.log", "*.txt"] {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }

    builder.build().unwrap_or_else(|_| GlobSet::empty())
});

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Output directory {0:?} already exists, refusing to mix two runs")]
    OutputExists(PathBuf),
    #[error("Cannot resume, {0:?} holds no persisted config")]
    MissingConfig(PathBuf),
    #[error("Failed to prepare {path:?}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize job config")]
    Config(#[from] serde_yaml::Error),
    #[error("Failed to spawn job process")]
    Spawn(#[source] io::Error),
}

/// Serialize `config` with the output path injected at the top level
pub fn render_config(config: &Value, output_path: &Path) -> Result<String, serde_yaml::Error> {
    let mut config = config.clone();

    if let Value::Mapping(mapping) = &mut config {
        mapping.insert(
            Value::from(OUTPUT_PATH_KEY),
            Value::from(output_path.to_string_lossy().as_ref()),
        );
    }

    serde_yaml::to_string(&config)
}

/// Create the output directory and persist the config, or check both exist when resuming
///
/// Returns the path of the persisted config file.
pub fn prepare_output(output_path: &Path, config: &str, resume: bool) -> Result<PathBuf, LaunchError> {
    let config_file = output_path.join(CONFIG_FILE);
    let prepare = |source| LaunchError::Prepare {
        path: output_path.to_path_buf(),
        source,
    };

    if resume {
        if !config_file.is_file() {
            return Err(LaunchError::MissingConfig(output_path.to_path_buf()));
        }

        return Ok(config_file);
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(prepare)?;
    }

    match fs::create_dir(output_path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
            return Err(LaunchError::OutputExists(output_path.to_path_buf()))
        }
        Err(error) => return Err(prepare(error)),
    }

    fs::write(&config_file, config).map_err(prepare)?;
    debug!(path = ?config_file, "Persisted job config");

    Ok(config_file)
}

/// Build `<interpreter...> <script> <config_file>` running inside `output_path`
///
/// stdout and stderr are appended to `out.txt`/`err.txt` so a resumed job keeps its history.
pub fn command(
    interpreter: &[String],
    script: &Path,
    config_file: &Path,
    output_path: &Path,
) -> Result<Command, LaunchError> {
    let open = |name: &str| {
        let path = output_path.join(name);

        File::options()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LaunchError::Prepare { path, source })
    };

    let mut command = match interpreter.split_first() {
        Some((program, args)) => {
            let mut command = Command::new(program);
            command.args(args).arg(script);
            command
        }
        None => Command::new(script),
    };

    command
        .arg(config_file)
        .current_dir(output_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(open(STDOUT_FILE)?))
        .stderr(Stdio::from(open(STDERR_FILE)?));

    Ok(command)
}

/// Read all `*.log` and `*.txt` files of an output directory, keyed by file stem
///
/// A directory that doesn't exist yet yields an empty map.
pub fn collect_logs(output_path: &Path) -> io::Result<LogMap> {
    let mut logs = LogMap::new();

    let entries = match fs::read_dir(output_path) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(logs),
        Err(error) => return Err(error),
    };

    for entry in entries {
        let path = entry?.path();

        let (Some(name), Some(stem)) = (path.file_name(), path.file_stem()) else {
            continue;
        };
        if !path.is_file() || !LOG_PATTERNS.is_match(name) {
            continue;
        }

        match fs::read(&path) {
            Ok(bytes) => {
                logs.insert(
                    stem.to_string_lossy().into_owned(),
                    String::from_utf8_lossy(&bytes).into_owned(),
                );
            }
            Err(error) => warn!(path = ?path, error = ?error, "Failed to read log"),
        }
    }

    Ok(logs)
}

pub fn remove_output(output_path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(output_path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
