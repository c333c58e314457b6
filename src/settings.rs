//! Settings files for nacgen.
//!
//! Site- and user-specific defaults (how the engine is started, which
//! scheduler is used, how the SLURM jobs are shaped) live in INI files, so
//! that a run on a given cluster only needs the geometry file and the
//! template on the command line. Files are applied in this order, later
//! files overriding individual keys of earlier ones:
//!
//! 1. System configuration (`/etc/nacgen/nacgen.cfg`)
//! 2. User configuration (`~/.config/nacgen/nacgen.cfg`)
//! 3. Local configuration (`./nacgen.cfg`)
//!
//! Command-line flags override all of them.
//!
//! # Configuration File Format
//!
//! ```ini
//! [engine]
//! command = run_qchem.sh
//! args = --wait {input} {nprocs} {mem}
//! output = {stem}.out
//! nprocs = 4
//! mem = 8Gb
//!
//! [cluster]
//! backend = slurm
//! retry_limit = 3
//! slurm_partition = short
//!
//! [output]
//! strict = false
//! states = 0,1
//!
//! [logging]
//! level = info
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use nacgen::settings::SettingsManager;
//! use std::path::PathBuf;
//!
//! let settings = SettingsManager::load()?;
//! let config = settings.run_config(PathBuf::from("traj.xyz"), PathBuf::from("grad.in"));
//! println!("Engine: {} (settings from {})", config.engine.command, settings.config_source());
//! # Ok::<(), nacgen::config::ConfigError>(())
//! ```

use crate::config::{parse_state_list, ClusterConfig, ConfigError, EngineConfig, RunConfig, Strictness};
use crate::naming::SETTINGS_FILE;
use configparser::ini::Ini;
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Output-related settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    /// Fail the run on any gap (default: false)
    pub strict: bool,
    /// States that must have forces in every frame (default: none)
    pub states: Vec<u32>,
    /// Work directory for run state (default: "TMP")
    pub work_dir: PathBuf,
    /// Directory for the output streams (default: ".")
    pub out_dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            strict: false,
            states: Vec::new(),
            work_dir: PathBuf::from("TMP"),
            out_dir: PathBuf::from("."),
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// All settings read from configuration files.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Engine invocation
    pub engine: EngineConfig,
    /// Scheduler settings
    pub cluster: ClusterConfig,
    /// Output settings
    pub output: OutputSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

type Section = HashMap<String, Option<String>>;

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads settings from the system, user and local configuration files.
    ///
    /// Missing files are skipped. A file that exists but is malformed is an
    /// error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut paths = Vec::new();
        paths.extend(Self::get_system_config_path());
        paths.extend(Self::get_user_config_path());
        paths.push(PathBuf::from(SETTINGS_FILE));
        let manager = Self::load_from(&paths)?;
        info!("Configuration loaded from: {}", manager.config_source);
        Ok(manager)
    }

    /// Loads settings from an explicit list of files, in order.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let mut sources = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            Self::apply_file(&mut settings, path)?;
            debug!("Applied settings from {}", path.display());
            sources.push(path.display().to_string());
        }
        let config_source = if sources.is_empty() {
            "built-in defaults".to_string()
        } else {
            sources.join(", ")
        };
        Ok(Self {
            settings,
            config_source,
        })
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Builds a run configuration seeded with these settings.
    pub fn run_config(&self, geometry_file: PathBuf, template_file: PathBuf) -> RunConfig {
        let mut config = RunConfig::new(geometry_file, template_file);
        config.engine = self.settings.engine.clone();
        config.cluster = self.settings.cluster.clone();
        config.strictness = if self.settings.output.strict {
            Strictness::Strict
        } else {
            Strictness::Relaxed
        };
        config.states = self.settings.output.states.clone();
        config.work_dir = self.settings.output.work_dir.clone();
        config.out_dir = self.settings.output.out_dir.clone();
        config
    }

    /// Applies the keys of one INI file on top of `settings`.
    fn apply_file(settings: &mut Settings, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        ini.read(content).map_err(|e| {
            ConfigError::IniParse(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        let map = ini.get_map_ref();

        if let Some(section) = map.get("engine") {
            Self::parse_engine(&mut settings.engine, section)?;
        }
        if let Some(section) = map.get("cluster") {
            Self::parse_cluster(&mut settings.cluster, section)?;
        }
        if let Some(section) = map.get("output") {
            Self::parse_output(&mut settings.output, section)?;
        }
        if let Some(section) = map.get("logging") {
            if let Some(level) = get(section, "level") {
                settings.logging.level = level.to_string();
            }
        }
        Ok(())
    }

    /// Parses the engine section from INI configuration.
    fn parse_engine(engine: &mut EngineConfig, section: &Section) -> Result<(), ConfigError> {
        if let Some(command) = get(section, "command") {
            engine.command = command.to_string();
        }
        if let Some(args) = get(section, "args") {
            engine.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(deck_name) = get(section, "deck_name") {
            engine.deck_name = deck_name.to_string();
        }
        if let Some(output) = get(section, "output") {
            engine.output = match output {
                "stdout" => None,
                name => Some(name.to_string()),
            };
        }
        if let Some(value) = get(section, "timeout_seconds") {
            engine.timeout_seconds = parse_value("engine", "timeout_seconds", value)?;
        }
        if let Some(value) = get(section, "nprocs") {
            engine.nprocs = parse_value("engine", "nprocs", value)?;
        }
        if let Some(mem) = get(section, "mem") {
            engine.mem = mem.to_string();
        }
        if let Some(scratch) = get(section, "scratch_dir") {
            engine.scratch_dir = Some(PathBuf::from(scratch));
        }
        Ok(())
    }

    /// Parses the cluster section from INI configuration.
    fn parse_cluster(cluster: &mut ClusterConfig, section: &Section) -> Result<(), ConfigError> {
        if let Some(backend) = get(section, "backend") {
            cluster.backend = backend.parse()?;
        }
        if let Some(value) = get(section, "retry_limit") {
            cluster.retry_limit = parse_value("cluster", "retry_limit", value)?;
        }
        if let Some(value) = get(section, "poll_interval_ms") {
            cluster.poll_interval_ms = parse_value("cluster", "poll_interval_ms", value)?;
        }
        if let Some(value) = get(section, "max_poll_interval_ms") {
            cluster.max_poll_interval_ms = parse_value("cluster", "max_poll_interval_ms", value)?;
        }
        if let Some(value) = get(section, "local_workers") {
            cluster.local_workers = parse_value("cluster", "local_workers", value)?;
        }
        if let Some(partition) = get(section, "slurm_partition") {
            cluster.slurm_partition = partition.to_string();
        }
        if let Some(time) = get(section, "slurm_time") {
            cluster.slurm_time = time.to_string();
        }
        if let Some(extra) = get(section, "slurm_extra") {
            // Parse comma-separated sbatch options
            cluster.slurm_extra = extra
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Parses the output section from INI configuration.
    fn parse_output(output: &mut OutputSettings, section: &Section) -> Result<(), ConfigError> {
        if let Some(value) = get(section, "strict") {
            output.strict = parse_value("output", "strict", value)?;
        }
        if let Some(states) = get(section, "states") {
            output.states = parse_state_list(states)?;
        }
        if let Some(dir) = get(section, "work_dir") {
            output.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(section, "out_dir") {
            output.out_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/nacgen").join(SETTINGS_FILE))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("nacgen").join(SETTINGS_FILE))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("nacgen")
                    .join(SETTINGS_FILE)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("nacgen").join(SETTINGS_FILE))
        }
    }
}

fn get<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .and_then(|v| v.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_value<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError::InvalidValue(format!("Invalid [{}] {} value: {}", section, key, value))
    })
}

impl SettingsManager {
    /// Creates a commented settings file with every option at its default.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nacgen::settings::SettingsManager;
    /// use std::path::Path;
    ///
    /// SettingsManager::create_template(Path::new("nacgen.cfg"))?;
    /// # Ok::<(), nacgen::config::ConfigError>(())
    /// ```
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    /// Generates the content for a nacgen.cfg template file.
    fn generate_template_content() -> String {
        let engine = EngineConfig::default();
        let cluster = ClusterConfig::default();
        let output = OutputSettings::default();
        let logging = LoggingSettings::default();
        format!(
            r#"# nacgen configuration file
#
# Files are applied in this order, later ones overriding earlier keys:
#
# 1. System config directory (/etc/nacgen/nacgen.cfg)
# 2. User config directory (~/.config/nacgen/nacgen.cfg)
# 3. Current working directory (./nacgen.cfg)
#
# Command-line flags override every file. Missing keys keep the defaults
# shown below.

[engine]
# Executable that runs one engine calculation
command = {command}

# Arguments, separated by whitespace. Placeholders:
# {{input}} deck file name, {{stem}} deck name without extension,
# {{nprocs}} processors, {{mem}} memory
args = {args}

# File name of the rendered deck inside the per-frame scratch directory
deck_name = {deck_name}

# Output file written by the engine, or "stdout" to capture standard output
output = {output}

# Wall-clock limit per frame in seconds
timeout_seconds = {timeout}

# Processors and memory per frame
nprocs = {nprocs}
mem = {mem}

# Root of the per-frame scratch directories (default: system temp dir)
# scratch_dir = /scratch/$USER

[cluster]
# Scheduler backend: local or slurm
backend = {backend}

# Resubmissions of a batch evicted by the cluster (node failure, preemption)
retry_limit = {retry_limit}

# Initial and maximum status polling interval in milliseconds
poll_interval_ms = {poll}
max_poll_interval_ms = {max_poll}

# Threads of the local backend (0 = one per batch)
local_workers = {local_workers}

# SLURM partition and time limit (empty = cluster defaults)
slurm_partition = {partition}
slurm_time = {time}

# Additional sbatch options, comma-separated
# Example: slurm_extra = --mem=8G,--qos=normal
slurm_extra = {extra}

[output]
# Fail the whole run if any frame is missing (true) or write what is
# available plus a gap list (false)
strict = {strict}

# States whose forces are required in every frame, comma-separated
# Example: states = 0,1,2
states = {states}

# Run state and output directories
work_dir = {work_dir}
out_dir = {out_dir}

[logging]
# Log level: debug, info, warn, error (RUST_LOG overrides it)
level = {level}
"#,
            command = engine.command,
            args = engine.args.join(" "),
            deck_name = engine.deck_name,
            output = engine.output.as_deref().unwrap_or("stdout"),
            timeout = engine.timeout_seconds,
            nprocs = engine.nprocs,
            mem = engine.mem,
            backend = cluster.backend,
            retry_limit = cluster.retry_limit,
            poll = cluster.poll_interval_ms,
            max_poll = cluster.max_poll_interval_ms,
            local_workers = cluster.local_workers,
            partition = cluster.slurm_partition,
            time = cluster.slurm_time,
            extra = cluster.slurm_extra.join(","),
            strict = output.strict,
            states = output
                .states
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
            work_dir = output.work_dir.display(),
            out_dir = output.out_dir.display(),
            level = logging.level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use tempfile::TempDir;

    #[test]
    fn test_template_round_trips_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nacgen.cfg");
        SettingsManager::create_template(&path).unwrap();

        let manager = SettingsManager::load_from(&[path]).unwrap();
        assert_eq!(manager.settings(), &Settings::default());
    }

    #[test]
    fn test_later_files_override_keys() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("system.cfg");
        let local = dir.path().join("local.cfg");
        fs::write(
            &system,
            "[engine]\nnprocs = 8\nmem = 16Gb\n[cluster]\nbackend = slurm\nslurm_partition = long\n",
        )
        .unwrap();
        fs::write(
            &local,
            "[engine]\nnprocs = 2\noutput = stdout\n[output]\nstrict = true\nstates = 1,0\n[logging]\nlevel = debug\n",
        )
        .unwrap();

        let manager =
            SettingsManager::load_from(&[system, dir.path().join("absent.cfg"), local]).unwrap();
        let settings = manager.settings();
        assert_eq!(settings.engine.nprocs, 2);
        assert_eq!(settings.engine.mem, "16Gb");
        assert_eq!(settings.engine.output, None);
        assert_eq!(settings.cluster.backend, Backend::Slurm);
        assert_eq!(settings.cluster.slurm_partition, "long");
        assert_eq!(manager.logging().level, "debug");

        let config = manager.run_config("t.xyz".into(), "g.in".into());
        assert_eq!(config.strictness, Strictness::Strict);
        assert_eq!(config.states, vec![0, 1]);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.cfg");
        fs::write(&path, "[cluster]\nretry_limit = many\n").unwrap();
        assert!(matches!(
            SettingsManager::load_from(&[path]),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
