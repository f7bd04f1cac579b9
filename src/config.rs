use crate::models::{object::CannedAcl, pipeline::ImageFormat};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub optim: OptimConfig,
}

/// Pipeline settings. Built once at start-up and shared read-only.
#[derive(Debug, Clone)]
pub struct OptimConfig {
    /// Bucket committed writes go to; `None` writes back to the source bucket.
    pub destination_bucket: Option<String>,
    /// Canned ACL applied to every committed write.
    pub acl: CannedAcl,
    /// Effort level handed to the PNG optimizer (0–7).
    pub png_level: u8,
    /// Objects larger than this are skipped; `None` means no limit.
    pub max_source_size: Option<u64>,
    /// Whether `optimized=yes` actually blocks reprocessing.
    pub enforce_already_optimized_skip: bool,
    pub jpeg_progressive: bool,
    /// Lowercase extensions (without dot) and the format each one selects.
    pub extensions: Vec<(String, ImageFormat)>,
    pub jpegtran_bin: String,
}

pub const MAX_PNG_LEVEL: u8 = 7;

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            destination_bucket: None,
            acl: CannedAcl::PublicRead,
            png_level: 7,
            max_source_size: None,
            enforce_already_optimized_skip: true,
            jpeg_progressive: true,
            extensions: vec![
                ("png".into(), ImageFormat::Png),
                ("jpg".into(), ImageFormat::Jpeg),
                ("jpeg".into(), ImageFormat::Jpeg),
            ],
            jpegtran_bin: "jpegtran".into(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Event-driven lossless image optimizer")]
pub struct Args {
    /// Host to bind to (overrides OPTIM_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OPTIM_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides OPTIM_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OPTIM_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("OPTIM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("OPTIM_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing OPTIM_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading OPTIM_PORT"),
        };
        let env_storage =
            env::var("OPTIM_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OPTIM_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/optim.db".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            optim: OptimConfig::from_env()?,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl OptimConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name))
    }

    /// Build the pipeline settings from any variable source.
    ///
    /// Unset and empty variables fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let read = |name: &str| -> Result<Option<String>> {
            match lookup(name) {
                Ok(value) if value.trim().is_empty() => Ok(None),
                Ok(value) => Ok(Some(value.trim().to_string())),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let mut cfg = Self::default();

        cfg.destination_bucket = read("OPTIM_UPLOAD_BUCKET")?;

        if let Some(value) = read("OPTIM_UPLOAD_ACL")? {
            cfg.acl = value
                .parse()
                .map_err(anyhow::Error::msg)
                .context("parsing OPTIM_UPLOAD_ACL")?;
        }

        if let Some(value) = read("OPTIM_PNG_LEVEL")? {
            let level = value
                .parse::<u8>()
                .with_context(|| format!("parsing OPTIM_PNG_LEVEL value `{}`", value))?;
            if level > MAX_PNG_LEVEL {
                bail!("OPTIM_PNG_LEVEL must be between 0 and {}, got {}", MAX_PNG_LEVEL, level);
            }
            cfg.png_level = level;
        }

        if let Some(value) = read("OPTIM_MAX_FILE_SIZE")? {
            let limit = value
                .parse::<i64>()
                .with_context(|| format!("parsing OPTIM_MAX_FILE_SIZE value `{}`", value))?;
            // zero and negative values mean "no limit"
            cfg.max_source_size = u64::try_from(limit).ok().filter(|limit| *limit > 0);
        }

        if let Some(value) = read("OPTIM_ENFORCE_OPTIMIZED_SKIP")? {
            cfg.enforce_already_optimized_skip =
                parse_bool(&value).context("parsing OPTIM_ENFORCE_OPTIMIZED_SKIP")?;
        }

        if let Some(value) = read("OPTIM_JPEG_PROGRESSIVE")? {
            cfg.jpeg_progressive = parse_bool(&value).context("parsing OPTIM_JPEG_PROGRESSIVE")?;
        }

        if let Some(value) = read("OPTIM_EXTENSIONS")? {
            cfg.extensions = parse_extensions(&value).context("parsing OPTIM_EXTENSIONS")?;
        }

        if let Some(value) = read("OPTIM_JPEGTRAN_BIN")? {
            cfg.jpegtran_bin = value;
        }

        Ok(cfg)
    }

    /// Format selected by the key's extension, if it is a configured one.
    pub fn format_for(&self, key: &str) -> Option<ImageFormat> {
        let (_, ext) = key.rsplit_once('.')?;
        self.extensions
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
            .map(|(_, format)| *format)
    }

    /// Bucket a commit for an object in `source_bucket` is written to.
    pub fn destination_for<'a>(&'a self, source_bucket: &'a str) -> &'a str {
        self.destination_bucket.as_deref().unwrap_or(source_bucket)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got `{}`", other),
    }
}

fn parse_extensions(value: &str) -> Result<Vec<(String, ImageFormat)>> {
    let mut extensions = Vec::new();
    for raw in value.split(',') {
        let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if ext.is_empty() {
            continue;
        }
        let Some(format) = ImageFormat::from_extension(&ext) else {
            bail!("no optimizer for extension `{}`", ext);
        };
        if !extensions.iter().any(|(known, _)| *known == ext) {
            extensions.push((ext, format));
        }
    }
    if extensions.is_empty() {
        bail!("at least one extension is required");
    }
    Ok(extensions)
}
