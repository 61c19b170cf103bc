//! Optional config file loading and run settings. Search order: ./mindtouch-zim.toml, then
//! $XDG_CONFIG_HOME/mindtouch-zim/config.toml (or ~/.config/mindtouch-zim/config.toml).

use crate::assets::{HashAlgorithm, TransformSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "mindtouch-zim.toml";
const CONFIG_DIR_NAME: &str = "mindtouch-zim";

const DEFAULT_PUBLISHER: &str = "openZIM";
const DEFAULT_LANGUAGE: &str = "eng";
const DEFAULT_ROOT_PAGE: &str = "home";
const DEFAULT_FILE_NAME_TEMPLATE: &str = "{name}_{period}";
const DEFAULT_PAGE_CONCURRENCY: usize = 4;
const DEFAULT_ASSET_CONCURRENCY: usize = 10;
const DEFAULT_DISCOVERY_CONCURRENCY: usize = 4;
const DEFAULT_LISTING_PAGE_SIZE: u32 = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 1;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 30;
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.1;
const DEFAULT_FAVICON_ALIAS: &str = "favicon.ico";

// Archive metadata limits.
const MAX_TITLE_CHARS: usize = 30;
const MAX_DESCRIPTION_CHARS: usize = 80;
const MAX_LONG_DESCRIPTION_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing required setting: {key}. Pass it on the command line or set it in the config file.")]
    Missing { key: &'static str },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Invalid file name template '{template}': unknown placeholder '{placeholder}'. Use {{name}}, {{slug}}, {{clean_slug}} or {{period}}.")]
    InvalidTemplate {
        template: String,
        placeholder: String,
    },
}

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Library subdomain on libretexts.org, e.g. `geo`.
    pub library_slug: Option<String>,
    /// Full library URL. Default: https://{library_slug}.libretexts.org
    pub library_url: Option<String>,
    /// Archive name (M/Name), e.g. `libretexts.org_en_geo`.
    pub name: Option<String>,
    pub title: Option<String>,
    pub creator: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// ISO-639-3 language code (default: eng).
    pub language: Option<String>,
    /// Root page id or `home` (default).
    pub root_page_id: Option<String>,
    /// Directory the archive is written to. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// Archive file name without extension; see [render_file_name].
    pub file_name_template: Option<String>,
    pub page_concurrency: Option<usize>,
    pub asset_concurrency: Option<usize>,
    /// Concurrent external tool runs (default: number of CPUs).
    pub tool_concurrency: Option<usize>,
    pub discovery_concurrency: Option<usize>,
    /// Entries per subpage listing request.
    pub listing_page_size: Option<u32>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Total HTTP attempts for transient failures (default 5).
    pub retry_count: Option<u32>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    /// Fraction of failed pages tolerated before the run aborts (default 0.1).
    pub failure_threshold: Option<f64>,
    /// Asset content hash: sha256 (default) or blake3.
    pub hash: Option<HashAlgorithm>,
    /// Asset URLs whose failures are expected and not counted.
    pub bad_assets_regex: Option<String>,
    /// Counted asset failures tolerated before the run aborts (default: unlimited).
    pub bad_assets_threshold: Option<usize>,
    /// Replace an existing archive at the target path.
    pub overwrite: Option<bool>,
    /// JSON progress file, rewritten after each stage.
    pub stats_file: Option<PathBuf>,
    /// HTTP User-Agent header. Overrides contact_info.
    pub user_agent: Option<String>,
    /// Contact (URL or e-mail) appended to the default User-Agent.
    pub contact_info: Option<String>,
    /// Redirects to the root page (default: ["index"]).
    pub root_aliases: Option<Vec<String>>,
    /// Redirect to the logo (default: favicon.ico). Empty disables it.
    pub favicon_alias: Option<String>,
    /// Logo URL used instead of the one found on the library home page.
    pub illustration_url: Option<String>,
    /// Value of M/Date. Left out when unset.
    pub date: Option<String>,
    pub page_title_include: Option<String>,
    pub page_id_include: Option<Vec<String>>,
    pub page_title_exclude: Option<String>,
    /// External tools applied to matching assets, first match wins.
    pub transforms: Option<Vec<TransformSpec>>,
}

impl Config {
    /// Combine two layers: every key set in `self` wins over `base`.
    pub fn merged_over(self, base: Config) -> Config {
        macro_rules! pick {
            ($top:ident, $bottom:ident; $($field:ident),* $(,)?) => {
                Config {
                    $($field: $top.$field.or($bottom.$field),)*
                }
            };
        }
        let top = self;
        pick!(
            top, base;
            library_slug,
            library_url,
            name,
            title,
            creator,
            publisher,
            description,
            long_description,
            tags,
            language,
            root_page_id,
            output_dir,
            file_name_template,
            page_concurrency,
            asset_concurrency,
            tool_concurrency,
            discovery_concurrency,
            listing_page_size,
            timeout_secs,
            retry_count,
            backoff_base_secs,
            backoff_max_secs,
            failure_threshold,
            hash,
            bad_assets_regex,
            bad_assets_threshold,
            overwrite,
            stats_file,
            user_agent,
            contact_info,
            root_aliases,
            favicon_alias,
            illustration_url,
            date,
            page_title_include,
            page_id_include,
            page_title_exclude,
            transforms,
        )
    }
}

/// Search order: (1) ./mindtouch-zim.toml, (2) $XDG_CONFIG_HOME/mindtouch-zim/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, ConfigError> {
    let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
    let mut paths = vec![cwd.join(CONFIG_FILE_NAME)];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join(CONFIG_DIR_NAME).join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            return load_config_file(path).map(Some);
        }
    }
    Ok(None)
}

/// Read one config file. Unlike [load_config], a missing file is an error.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub library_slug: String,
    /// Without trailing slash.
    pub library_url: String,
    pub name: String,
    pub title: String,
    pub creator: String,
    pub publisher: String,
    pub description: String,
    pub long_description: Option<String>,
    pub tags: Vec<String>,
    pub language: String,
    pub root_page_id: String,
    pub output_dir: PathBuf,
    pub file_name_template: String,
    pub page_concurrency: usize,
    pub asset_concurrency: usize,
    pub tool_concurrency: usize,
    pub discovery_concurrency: usize,
    pub listing_page_size: u32,
    pub timeout: Duration,
    pub retry_count: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub failure_threshold: f64,
    pub hash: HashAlgorithm,
    pub bad_assets_regex: Option<String>,
    pub bad_assets_threshold: Option<usize>,
    pub overwrite: bool,
    pub stats_file: Option<PathBuf>,
    /// None keeps the client's default User-Agent.
    pub user_agent: Option<String>,
    pub root_aliases: Vec<String>,
    pub favicon_alias: Option<String>,
    pub illustration_url: Option<String>,
    pub date: Option<String>,
    pub page_title_include: Option<String>,
    pub page_id_include: Vec<String>,
    pub page_title_exclude: Option<String>,
    pub transforms: Vec<TransformSpec>,
}

impl RunConfig {
    /// Apply defaults to a merged [Config] and validate the result.
    pub fn resolve(config: Config) -> Result<Self, ConfigError> {
        let library_slug = non_empty(config.library_slug).ok_or(ConfigError::Missing {
            key: "library_slug",
        })?;
        let name = non_empty(config.name).ok_or(ConfigError::Missing { key: "name" })?;
        let library_url = non_empty(config.library_url)
            .unwrap_or_else(|| format!("https://{}.libretexts.org", library_slug))
            .trim_end_matches('/')
            .to_string();
        let title = non_empty(config.title).unwrap_or_else(|| name.clone());
        let description = non_empty(config.description).unwrap_or_else(|| title.clone());
        let creator = non_empty(config.creator).unwrap_or_else(|| default_creator(&library_url));

        check_length("title", &title, MAX_TITLE_CHARS)?;
        check_length("description", &description, MAX_DESCRIPTION_CHARS)?;
        if let Some(long) = &config.long_description {
            check_length("long_description", long, MAX_LONG_DESCRIPTION_CHARS)?;
        }

        let failure_threshold = config.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if !(0.0..=1.0).contains(&failure_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "failure_threshold",
                reason: format!("{} is not between 0 and 1", failure_threshold),
            });
        }

        let file_name_template = non_empty(config.file_name_template)
            .unwrap_or_else(|| DEFAULT_FILE_NAME_TEMPLATE.to_string());
        render_file_name(&file_name_template, &name, &library_slug, "2000-01")?;

        let backoff_base = Duration::from_secs(config.backoff_base_secs.unwrap_or(DEFAULT_BACKOFF_BASE_SECS));
        let backoff_max = Duration::from_secs(config.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS));

        let user_agent = non_empty(config.user_agent).or_else(|| {
            non_empty(config.contact_info).map(|contact| {
                format!("mindtouch-zim/{} (+{})", env!("CARGO_PKG_VERSION"), contact)
            })
        });

        Ok(Self {
            library_slug,
            library_url,
            name,
            title,
            creator,
            publisher: non_empty(config.publisher).unwrap_or_else(|| DEFAULT_PUBLISHER.to_string()),
            description,
            long_description: non_empty(config.long_description),
            tags: config
                .tags
                .unwrap_or_default()
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            language: non_empty(config.language).unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            root_page_id: non_empty(config.root_page_id)
                .unwrap_or_else(|| DEFAULT_ROOT_PAGE.to_string()),
            output_dir: config.output_dir.unwrap_or_else(|| PathBuf::from(".")),
            file_name_template,
            page_concurrency: positive("page_concurrency", config.page_concurrency, DEFAULT_PAGE_CONCURRENCY)?,
            asset_concurrency: positive("asset_concurrency", config.asset_concurrency, DEFAULT_ASSET_CONCURRENCY)?,
            tool_concurrency: positive("tool_concurrency", config.tool_concurrency, default_tool_concurrency())?,
            discovery_concurrency: positive(
                "discovery_concurrency",
                config.discovery_concurrency,
                DEFAULT_DISCOVERY_CONCURRENCY,
            )?,
            listing_page_size: config.listing_page_size.unwrap_or(DEFAULT_LISTING_PAGE_SIZE).max(1),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
            retry_count: config
                .retry_count
                .unwrap_or(crate::mindtouch::DEFAULT_RETRY_COUNT)
                .max(1),
            backoff_base,
            backoff_max: backoff_max.max(backoff_base),
            failure_threshold,
            hash: config.hash.unwrap_or_default(),
            bad_assets_regex: non_empty(config.bad_assets_regex),
            bad_assets_threshold: config.bad_assets_threshold,
            overwrite: config.overwrite.unwrap_or(false),
            stats_file: config.stats_file,
            user_agent,
            root_aliases: config
                .root_aliases
                .unwrap_or_else(|| vec!["index".to_string()]),
            favicon_alias: match config.favicon_alias {
                Some(alias) if alias.trim().is_empty() => None,
                Some(alias) => Some(alias),
                None => Some(DEFAULT_FAVICON_ALIAS.to_string()),
            },
            illustration_url: non_empty(config.illustration_url),
            date: non_empty(config.date),
            page_title_include: non_empty(config.page_title_include),
            page_id_include: config.page_id_include.unwrap_or_default(),
            page_title_exclude: non_empty(config.page_title_exclude),
            transforms: config.transforms.unwrap_or_default(),
        })
    }

    /// Archive file name for a period such as `2024-10`, with `.zim` appended.
    pub fn archive_file_name(&self, period: &str) -> Result<String, ConfigError> {
        render_file_name(&self.file_name_template, &self.name, &self.library_slug, period)
            .map(|stem| format!("{}.zim", stem))
    }

    /// Target path of this month's archive.
    pub fn archive_path(&self) -> Result<PathBuf, ConfigError> {
        let period = chrono::Utc::now().format("%Y-%m").to_string();
        Ok(self.output_dir.join(self.archive_file_name(&period)?))
    }
}

/// Expand `{name}`, `{slug}`, `{clean_slug}` and `{period}` in `template`.
pub fn render_file_name(
    template: &str,
    name: &str,
    slug: &str,
    period: &str,
) -> Result<String, ConfigError> {
    let invalid = |placeholder: &str| ConfigError::InvalidTemplate {
        template: template.to_string(),
        placeholder: placeholder.to_string(),
    };
    let mut out = String::with_capacity(template.len() + name.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let close = tail.find('}').ok_or_else(|| invalid(&rest[open..]))?;
        match &tail[..close] {
            "name" => out.push_str(name),
            "slug" => out.push_str(slug),
            "clean_slug" => out.push_str(&clean_slug(slug)),
            "period" => out.push_str(period),
            other => return Err(invalid(other)),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    if out.is_empty() || out.contains(|c| c == '/' || c == '\\') {
        return Err(ConfigError::InvalidValue {
            key: "file_name_template",
            reason: format!("'{}' is not a valid file name", out),
        });
    }
    Ok(out)
}

/// Slug with every char outside `[.a-zA-Z0-9]` replaced by `-`.
fn clean_slug(slug: &str) -> String {
    slug.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect()
}

fn default_creator(library_url: &str) -> String {
    reqwest::Url::parse(library_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| "MindTouch".to_string())
}

fn default_tool_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn positive(key: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            reason: "must be at least 1".to_string(),
        }),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

fn check_length(key: &'static str, value: &str, max: usize) -> Result<(), ConfigError> {
    let len = value.chars().count();
    if len > max {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("{} characters, at most {} allowed", len, max),
        });
    }
    Ok(())
}
