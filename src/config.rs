use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port for the control surface
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Folder to watch for incoming scans
    #[arg(long, env = "WATCH_DIR")]
    pub watch_dir: Option<String>,

    /// Folder that receives renamed files
    #[arg(long, env = "OUTPUT_DIR")]
    pub output_dir: Option<String>,

    /// Start watching immediately instead of waiting for the control panel
    #[arg(long, env = "AUTOSTART")]
    pub autostart: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub intake: IntakeConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntakeConfig {
    pub watch_dir: Option<String>,
    pub output_dir: Option<String>,
    pub blocked_terms: Vec<String>,
    pub autostart: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub key: Option<String>,
    pub model: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 3000)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("intake.blocked_terms", Vec::<String>::new())?
            .set_default("intake.autostart", false)?
            .set_default("api.base_url", "https://api.openai.com")?
            .set_default("api.model", "gpt-4o-mini")?;

        // The conventional variable is the lowest-priority credential source;
        // SCANSORT_API__KEY or the configure endpoint wins over it.
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                builder = builder.set_default("api.key", key)?;
            }
        }

        // 2. Optional config file: explicit path first, ./config.* fallback
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        // 3. Environment variables (prefixed with SCANSORT_)
        // E.g. SCANSORT_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("SCANSORT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Manual CLI overrides
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(dir) = cli.watch_dir {
            builder = builder.set_override("intake.watch_dir", dir)?;
        }
        if let Some(dir) = cli.output_dir {
            builder = builder.set_override("intake.output_dir", dir)?;
        }
        if let Some(autostart) = cli.autostart {
            builder = builder.set_override("intake.autostart", autostart)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}
