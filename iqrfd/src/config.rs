use iqrfd_api::bus::MessagingInstance;
use iqrfd_api::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::env;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub enumerator: EnumConfig,
    #[serde(default)]
    pub sensor_data: SensorDataConfig,
    #[serde(default)]
    pub raw_api: RawApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub js: JsConfig,

    // The file this configuration was read from, if any. Components
    // that persist updated settings (sensor-data SetConfig) write
    // back to it.
    #[serde(skip)]
    pub path: Option<String>,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            store: StoreConfig::default(),
            enumerator: EnumConfig::default(),
            sensor_data: SensorDataConfig::default(),
            raw_api: RawApiConfig::default(),
            cache: CacheConfig::default(),
            js: JsConfig::default(),
            path: None,
        }
    }
}

fn def_db_path() -> String {
    String::from("iqrf.db")
}

fn def_migration_dir() -> String {
    String::from("migrations")
}

#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file; created if missing.
    #[serde(default = "def_db_path")]
    pub path: String,
    /// Directory holding the migration SQL files, applied in lexical
    /// order of their stems.
    #[serde(default = "def_migration_dir")]
    pub migrations: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: def_db_path(),
            migrations: def_migration_dir(),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct EnumConfig {
    /// Run enumeration passes automatically before any explicit
    /// invocation arrives.
    #[serde(default)]
    pub auto_enumerate_before_invoked: bool,
    /// Kick off a pass as soon as the daemon launches.
    #[serde(default)]
    pub enumerate_on_launch: bool,
    /// Attach stored device metadata to API responses.
    #[serde(default)]
    pub metadata_to_messages: bool,
}

fn def_period() -> u32 {
    10
}

fn def_retry_period() -> u32 {
    1
}

#[derive(Clone, Deserialize, Serialize)]
pub struct SensorDataConfig {
    /// Start the reading worker on launch.
    #[serde(default)]
    pub auto_run: bool,
    /// Minutes between reading passes.
    #[serde(default = "def_period")]
    pub period: u32,
    /// Minutes to wait before retrying after a failed
    /// exclusive-access acquisition.
    #[serde(default = "def_retry_period")]
    pub retry_period: u32,
    /// Publish "reading started"/"reading done" reports.
    #[serde(default)]
    pub async_reports: bool,
    /// Endpoints the reports go to.
    #[serde(default)]
    pub messaging_list: Vec<MessagingInstance>,
}

impl Default for SensorDataConfig {
    fn default() -> Self {
        SensorDataConfig {
            auto_run: false,
            period: def_period(),
            retry_period: def_retry_period(),
            async_reports: false,
            messaging_list: vec![],
        }
    }
}

fn def_instance() -> String {
    String::from("raw")
}

#[derive(Clone, Deserialize)]
pub struct RawApiConfig {
    /// Forward async DPA frames as `iqrfRaw` broadcasts.
    #[serde(default)]
    pub async_dpa_message: bool,
    #[serde(default = "def_instance")]
    pub instance: String,
}

impl Default for RawApiConfig {
    fn default() -> Self {
        RawApiConfig {
            async_dpa_message: false,
            instance: def_instance(),
        }
    }
}

fn def_url_repo() -> String {
    String::from("https://repository.iqrfalliance.org/api")
}

fn def_cache_dir() -> String {
    String::from("iqrfRepoCache")
}

fn def_check_period() -> u32 {
    60
}

#[derive(Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "def_url_repo")]
    pub url_repo: String,
    #[serde(default = "def_cache_dir")]
    pub cache_dir: String,
    /// Minutes between cache refresh checks; must be at least 1.
    #[serde(default = "def_check_period")]
    pub check_period: u32,
    #[serde(default)]
    pub download_if_empty: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            url_repo: def_url_repo(),
            cache_dir: def_cache_dir(),
            check_period: def_check_period(),
            download_if_empty: false,
        }
    }
}

fn def_wrapper_path() -> String {
    String::from("javaScript/DaemonWrapper.js")
}

#[derive(Clone, Deserialize)]
pub struct JsConfig {
    /// Path of the daemon wrapper source appended to every driver
    /// context.
    #[serde(default = "def_wrapper_path")]
    pub wrapper_path: String,
}

impl Default for JsConfig {
    fn default() -> Self {
        JsConfig {
            wrapper_path: def_wrapper_path(),
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("IQRF Gateway Daemon")
        .version(crate_version!())
        .about("Bridges an IQRF mesh network to a message bus.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    // The number of '-v' options determines the log level.

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| Error::ConfigError(format!("{}", e)))
        .and_then(|cfg: Config| {
            if cfg.cache.check_period < 1 {
                return Err(Error::ConfigError(
                    "'cache.check_period' must be at least 1 minute".into(),
                ));
            }

            if cfg.sensor_data.period < 1 {
                return Err(Error::ConfigError(
                    "'sensor_data.period' must be at least 1 minute".into(),
                ));
            }
            Ok(cfg)
        })
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents).map(|mut cfg| {
            cfg.path = Some(path.to_string());
            cfg
        }))
    } else {
        None
    }
}

async fn find_cfg(explicit: Option<&str>) -> Result<Config> {
    const CFG_FILE: &str = "iqrfd.toml";

    if let Some(path) = explicit {
        return match from_file(path).await {
            Some(cfg) => cfg,
            None => Err(Error::ConfigError(format!(
                "couldn't read config file '{}'",
                path
            ))),
        };
    }

    // Directories that could contain a configuration file, searched
    // in order.

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}\n", cfg.get_log_level());
    println!("Store:");
    println!("    database: {}", &cfg.store.path);
    println!("    migrations: {}\n", &cfg.store.migrations);
    println!("Enumerator:");
    println!(
        "    auto enumerate: {}\n    enumerate on launch: {}\n    \
	 metadata to messages: {}\n",
        cfg.enumerator.auto_enumerate_before_invoked,
        cfg.enumerator.enumerate_on_launch,
        cfg.enumerator.metadata_to_messages
    );
    println!("Sensor data:");
    println!(
        "    auto run: {}\n    period: {} min\n    retry period: {} min\n",
        cfg.sensor_data.auto_run,
        cfg.sensor_data.period,
        cfg.sensor_data.retry_period
    );
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    // Peek at the command line for an explicit config file before
    // letting it override the parsed values.

    let explicit = env::args()
        .zip(env::args().skip(1))
        .find(|(flag, _)| flag == "-c" || flag == "--config")
        .map(|(_, path)| path);

    match find_cfg(explicit.as_deref()).await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = parse_config("").unwrap();

        assert_eq!(cfg.get_log_level(), Level::WARN);
        assert_eq!(cfg.store.path, "iqrf.db");
        assert!(!cfg.enumerator.enumerate_on_launch);
        assert_eq!(cfg.sensor_data.period, 10);
        assert_eq!(cfg.sensor_data.retry_period, 1);
        assert!(!cfg.raw_api.async_dpa_message);
        assert_eq!(cfg.cache.check_period, 60);
    }

    #[test]
    fn test_sections() {
        let cfg = parse_config(
            r#"
log_level = "debug"

[store]
path = "/var/lib/iqrfd/net.db"

[enumerator]
enumerate_on_launch = true
metadata_to_messages = true

[sensor_data]
auto_run = true
period = 15
retry_period = 2
async_reports = true
messaging_list = [{ type = "mqtt", instance = "default" }]

[raw_api]
async_dpa_message = true
instance = "raw-1"
"#,
        )
        .unwrap();

        assert_eq!(cfg.get_log_level(), Level::DEBUG);
        assert_eq!(cfg.store.path, "/var/lib/iqrfd/net.db");
        assert!(cfg.enumerator.enumerate_on_launch);
        assert!(cfg.enumerator.metadata_to_messages);
        assert!(cfg.sensor_data.auto_run);
        assert_eq!(cfg.sensor_data.period, 15);
        assert_eq!(cfg.sensor_data.retry_period, 2);
        assert_eq!(cfg.sensor_data.messaging_list.len(), 1);
        assert_eq!(cfg.sensor_data.messaging_list[0].kind, "mqtt");
        assert!(cfg.raw_api.async_dpa_message);
        assert_eq!(cfg.raw_api.instance, "raw-1");
    }

    #[test]
    fn test_validation() {
        assert!(parse_config("[cache]\ncheck_period = 0").is_err());
        assert!(parse_config("[sensor_data]\nperiod = 0").is_err());
    }
}
