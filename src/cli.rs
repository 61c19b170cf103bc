//! CLI parsing and orchestration. Parses args, layers them over the config file, runs the
//! pipeline and maps errors to exit codes.

use crate::assets::HashAlgorithm;
use crate::config::{self, Config, ConfigError, RunConfig};
use crate::pipeline::{Pipeline, PipelineError, Progress, RunReport, RunState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("Cannot start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::Config(_) => 1,
            CliRunError::Pipeline(e) => match e {
                PipelineError::Config(_)
                | PipelineError::Pattern { .. }
                | PipelineError::ArchiveExists { .. } => 1,
                PipelineError::Archive(_) => 3,
                _ => 2,
            },
            CliRunError::Runtime(_) => 2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mindtouch-zim")]
#[command(about = "Convert a MindTouch library (e.g. a LibreTexts subject library) into an offline ZIM archive")]
#[command(
    after_help = "Every option can also be set in mindtouch-zim.toml (snake_case keys, e.g. page_concurrency). CLI flags override config."
)]
pub struct Args {
    /// Library slug, e.g. `geo` for https://geo.libretexts.org.
    #[arg(short = 's', long)]
    pub library_slug: Option<String>,

    /// Library URL. Default: https://{slug}.libretexts.org
    #[arg(long)]
    pub library_url: Option<String>,

    /// Archive name (M/Name), e.g. libretexts.org_en_geo.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Archive title (at most 30 characters). Default: the name.
    #[arg(long)]
    pub title: Option<String>,

    /// Archive creator. Default: the library host name.
    #[arg(long)]
    pub creator: Option<String>,

    /// Archive publisher (default: openZIM).
    #[arg(long)]
    pub publisher: Option<String>,

    /// Archive description (at most 80 characters). Default: the title.
    #[arg(long)]
    pub description: Option<String>,

    /// Long archive description (at most 4000 characters).
    #[arg(long)]
    pub long_description: Option<String>,

    /// Semicolon-separated archive tags.
    #[arg(long)]
    pub tags: Option<String>,

    /// ISO-639-3 language code (default: eng).
    #[arg(long)]
    pub language: Option<String>,

    /// Root page id (default: home).
    #[arg(long)]
    pub root_page_id: Option<String>,

    /// Output directory (default: current directory).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Archive file name without .zim. Placeholders: {name}, {slug}, {clean_slug}, {period}.
    #[arg(long)]
    pub file_name_template: Option<String>,

    /// Pages fetched concurrently (default 4).
    #[arg(long)]
    pub page_concurrency: Option<usize>,

    /// Assets fetched concurrently (default 10).
    #[arg(long)]
    pub asset_concurrency: Option<usize>,

    /// External tools run concurrently (default: number of CPUs).
    #[arg(long)]
    pub tool_concurrency: Option<usize>,

    /// Request timeout in seconds (default 15).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Total HTTP attempts for transient failures (default 5).
    #[arg(long)]
    pub retry_count: Option<u32>,

    /// Fraction of failed pages tolerated before aborting, 0 to 1 (default 0.1).
    #[arg(long)]
    pub failure_threshold: Option<f64>,

    /// Asset content hash: sha256 (default) or blake3.
    #[arg(long)]
    pub hash: Option<HashAlgorithm>,

    /// Regex of asset URLs whose failures are expected and not counted.
    #[arg(long)]
    pub bad_assets_regex: Option<String>,

    /// Abort when more than this many assets fail (default: never).
    #[arg(long)]
    pub bad_assets_threshold: Option<usize>,

    /// Replace an existing archive.
    #[arg(long)]
    pub overwrite: bool,

    /// Write {"done", "total"} progress to this JSON file.
    #[arg(long)]
    pub stats_file: Option<PathBuf>,

    /// HTTP User-Agent (overrides config and --contact-info).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Contact URL or e-mail added to the default User-Agent.
    #[arg(long)]
    pub contact_info: Option<String>,

    /// Logo URL used instead of the library's own.
    #[arg(long)]
    pub illustration_url: Option<String>,

    /// Only pages whose title matches this regex (plus their ancestors).
    #[arg(long)]
    pub page_title_include: Option<String>,

    /// Only these comma-separated page ids (plus their ancestors).
    #[arg(long)]
    pub page_id_include: Option<String>,

    /// Leave out pages whose title matches this regex.
    #[arg(long)]
    pub page_title_exclude: Option<String>,

    /// Config file to use instead of the default search locations.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Discover pages, print the page count and archive path without fetching content.
    #[arg(long)]
    pub dry_run: bool,

    /// Suppress progress output (warnings and errors only).
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and verbose error chain.
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    /// The CLI layer of the settings; unset flags stay None.
    pub fn to_config(&self) -> Config {
        Config {
            library_slug: self.library_slug.clone(),
            library_url: self.library_url.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            creator: self.creator.clone(),
            publisher: self.publisher.clone(),
            description: self.description.clone(),
            long_description: self.long_description.clone(),
            tags: self.tags.as_deref().map(|t| split_list(t, ';')),
            language: self.language.clone(),
            root_page_id: self.root_page_id.clone(),
            output_dir: self.output_dir.clone(),
            file_name_template: self.file_name_template.clone(),
            page_concurrency: self.page_concurrency,
            asset_concurrency: self.asset_concurrency,
            tool_concurrency: self.tool_concurrency,
            timeout_secs: self.timeout,
            retry_count: self.retry_count,
            failure_threshold: self.failure_threshold,
            hash: self.hash,
            bad_assets_regex: self.bad_assets_regex.clone(),
            bad_assets_threshold: self.bad_assets_threshold,
            overwrite: self.overwrite.then_some(true),
            stats_file: self.stats_file.clone(),
            user_agent: self.user_agent.clone(),
            contact_info: self.contact_info.clone(),
            illustration_url: self.illustration_url.clone(),
            page_title_include: self.page_title_include.clone(),
            page_id_include: self.page_id_include.as_deref().map(|ids| split_list(ids, ',')),
            page_title_exclude: self.page_title_exclude.clone(),
            ..Config::default()
        }
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// CLI flags over the config file over defaults.
fn resolve_settings(args: &Args) -> Result<RunConfig, CliRunError> {
    let file = match &args.config {
        Some(path) => Some(config::load_config_file(path)?),
        None => config::load_config()?,
    };
    let merged = args.to_config().merged_over(file.unwrap_or_default());
    Ok(RunConfig::resolve(merged)?)
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let settings = resolve_settings(args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliRunError::Runtime)?;
    runtime.block_on(run_pipeline(args, settings))
}

async fn run_pipeline(args: &Args, settings: RunConfig) -> Result<(), CliRunError> {
    let pipeline = Pipeline::new(settings)?;

    let abort = pipeline.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.store(true, Ordering::SeqCst);
        }
    });

    if args.dry_run {
        let plan = pipeline.plan().await?;
        eprintln!("Library: {}", plan.library_url);
        eprintln!("Root page: {}", plan.root_id);
        eprintln!("Pages: {}", plan.pages.len());
        if !plan.skipped_listings.is_empty() {
            eprintln!("Skipped listings: {}", plan.skipped_listings.len());
        }
        eprintln!("Output: {}", plan.archive_path.display());
        return Ok(());
    }

    let ticker = (!args.quiet).then(|| spawn_progress_bar(pipeline.progress()));
    let result = pipeline.run().await;
    if let Some((handle, bar)) = ticker {
        handle.abort();
        bar.finish_and_clear();
    }
    tracing::debug!(state = ?RunState::of(&result), "run finished");
    let report = result?;
    if !args.quiet {
        print_summary(&report);
    }
    Ok(())
}

fn spawn_progress_bar(
    progress: Arc<Progress>,
) -> (tokio::task::JoinHandle<()>, indicatif::ProgressBar) {
    let bar = indicatif::ProgressBar::new(0);
    if let Ok(style) = indicatif::ProgressStyle::default_bar()
        .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
    {
        bar.set_style(
            style
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
    }
    bar.enable_steady_tick(Duration::from_millis(80));
    let shown = bar.clone();
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            interval.tick().await;
            let s = progress.snapshot();
            shown.set_length(s.total() as u64);
            shown.set_position(s.done() as u64);
            if s.pages_total == 0 {
                shown.set_message(format!("Discovering pages ({})", s.pages_discovered));
            } else {
                shown.set_message(format!(
                    "Pages {}/{}, assets {}/{}",
                    s.pages_rewritten + s.pages_failed,
                    s.pages_total,
                    s.assets_resolved,
                    s.assets_total
                ));
            }
        }
    });
    (handle, bar)
}

fn print_summary(report: &RunReport) {
    if let Some(path) = &report.archive {
        eprintln!("Wrote {}", path.display());
    }
    eprintln!(
        "Pages: {}, assets: {}",
        report.pages_written, report.assets_stored
    );
    for failure in &report.failed_pages {
        eprintln!("Skipped page: {}", failure);
    }
    for skipped in &report.skipped_listings {
        eprintln!("Skipped listing: {}", skipped);
    }
    for failure in report.failed_assets.iter().filter(|f| f.counted) {
        eprintln!("Missing asset {}: {}", failure.url, failure.error);
    }
    if !report.warnings.is_empty() {
        eprintln!("Pages with repaired markup: {}", report.warnings.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveError;
    use crate::mindtouch::FetchError;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("mindtouch-zim").chain(argv.iter().copied()))
    }

    #[test]
    fn flags_become_config_layer() {
        let args = parse(&[
            "-s",
            "geo",
            "--name",
            "libretexts.org_en_geo",
            "--tags",
            "libretexts; geology;;",
            "--page-id-include",
            "28207, 1234",
            "--hash",
            "blake3",
            "--overwrite",
        ]);
        let c = args.to_config();
        assert_eq!(c.library_slug.as_deref(), Some("geo"));
        assert_eq!(
            c.tags,
            Some(vec!["libretexts".to_string(), "geology".to_string()])
        );
        assert_eq!(
            c.page_id_include,
            Some(vec!["28207".to_string(), "1234".to_string()])
        );
        assert_eq!(c.hash, Some(HashAlgorithm::Blake3));
        assert_eq!(c.overwrite, Some(true));
        assert!(c.page_concurrency.is_none());
    }

    #[test]
    fn absent_overwrite_flag_keeps_file_value() {
        let c = parse(&[]).to_config();
        assert!(c.overwrite.is_none());
        let file = Config {
            overwrite: Some(true),
            ..Config::default()
        };
        assert_eq!(c.merged_over(file).overwrite, Some(true));
    }

    #[test]
    fn invalid_hash_flag_is_rejected() {
        let result = Args::try_parse_from(["mindtouch-zim", "--hash", "md5"]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_config_file_is_invalid_input() {
        let args = parse(&["--config", "/nonexistent_dir_mindtouch_zim/config.toml"]);
        let err = resolve_settings(&args).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn cli_run_error_exit_codes() {
        assert_eq!(
            CliRunError::Config(ConfigError::Missing { key: "name" }).exit_code(),
            1
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::ArchiveExists {
                path: PathBuf::from("x.zim")
            })
            .exit_code(),
            1
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::Connect(FetchError::HttpStatus {
                status: 503,
                url: "https://geo.libretexts.org/".into()
            }))
            .exit_code(),
            2
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::TooManyFailures {
                failed: 2,
                total: 10,
                threshold: 0.1
            })
            .exit_code(),
            2
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::Archive(ArchiveError::DuplicateEntry {
                path: "index".into()
            }))
            .exit_code(),
            3
        );
    }
}
