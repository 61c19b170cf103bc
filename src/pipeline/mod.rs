//! Pipeline Coordinator: discovery, page fetch and rewrite, assets, assembly.
//!
//! Every network stage runs before the archive is opened. A fatal condition raises the
//! shared abort flag, workers stop at their next item, and no archive is published.

pub mod filter;
pub mod progress;

pub use filter::ContentFilter;
pub use progress::{Progress, ProgressSnapshot, StatsFile};

use crate::archive::{
    self, ArchiveError, ArchiveMetadata, ArchiveSink, AssemblyInput, AssemblyReport, Logo,
    Stylesheet, ZipContainer, INLINE_CSS_PATH, LOGO_PATH, PRINT_CSS_PATH, SCREEN_CSS_PATH,
};
use crate::assets::{
    bad_assets_regex, AssetFailure, AssetPipeline, AssetPipelineConfig, AssetStageError,
    AssetTransform, ExternalTool, MISSING_ASSET_PATH,
};
use crate::config::{ConfigError, RunConfig};
use crate::mindtouch::{
    self, fetch_page, DiscoveryError, DiscoveryOptions, FetchError, Library, LibraryHome,
    PageFetchError, PoliteClient,
};
use crate::model::{AssetReference, ManifestBuilder, Page, PageContent};
use crate::rewrite::{
    css, serialize, substitute_placeholders, KnownPages, RewriteError, RewriteOutput,
    RewriteWarning, Rewriter,
};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Fatal conditions of a run. Each one means no archive was published.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Invalid {what} pattern: {source}")]
    Pattern {
        what: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Archive {path} already exists. Use --overwrite to replace it.")]
    ArchiveExists { path: PathBuf },

    #[error("Cannot reach library: {0}")]
    Connect(#[source] FetchError),

    #[error("{0}")]
    Discovery(#[from] DiscoveryError),

    #[error("{0}")]
    Rewrite(#[from] RewriteError),

    #[error("Root page failed: {0}")]
    RootPage(#[source] PageFetchError),

    #[error("{failed} of {total} page(s) failed, above the tolerated fraction {threshold}")]
    TooManyFailures {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("{0}")]
    Assets(#[from] AssetStageError),

    #[error("{0}")]
    Archive(#[from] ArchiveError),

    #[error("Run interrupted")]
    Interrupted,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    /// Some pages, listings or assets were left out, within the tolerated limits.
    CompletedWithSkips,
    Aborted,
}

impl RunState {
    pub fn of(result: &Result<RunReport, PipelineError>) -> RunState {
        match result {
            Ok(report) => report.state,
            Err(_) => RunState::Aborted,
        }
    }
}

/// What a finished run produced and what it left out.
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    /// Published archive, when the run wrote to a file.
    pub archive: Option<PathBuf>,
    pub pages_written: usize,
    pub failed_pages: Vec<PageFetchError>,
    pub skipped_listings: Vec<DiscoveryError>,
    pub failed_assets: Vec<AssetFailure>,
    pub assets_stored: usize,
    pub warnings: Vec<RewriteWarning>,
    pub assembly: AssemblyReport,
}

/// Result of discovery and filtering, without any page fetch.
#[derive(Debug)]
pub struct Plan {
    pub archive_path: PathBuf,
    pub library_url: String,
    pub root_id: String,
    /// Pages that would be fetched, root first, in manifest order.
    pub pages: Vec<Page>,
    pub skipped_listings: Vec<DiscoveryError>,
}

/// Everything gathered from the network, ready for assembly.
struct Collected {
    input: AssemblyInput,
    failed_pages: Vec<PageFetchError>,
    skipped_listings: Vec<DiscoveryError>,
    failed_assets: Vec<AssetFailure>,
    assets_stored: usize,
    warnings: Vec<RewriteWarning>,
}

struct Discovered {
    library: Library,
    home: LibraryHome,
    pages: Vec<Page>,
    skipped: Vec<DiscoveryError>,
}

struct PageStage {
    /// Successful pages in manifest order.
    pages: Vec<(Page, RewriteOutput)>,
    failed: Vec<PageFetchError>,
}

/// Runs one library through every stage.
pub struct Pipeline {
    config: RunConfig,
    client: PoliteClient,
    filter: ContentFilter,
    transforms: Vec<Arc<dyn AssetTransform>>,
    progress: Arc<Progress>,
    abort: Arc<AtomicBool>,
    stats: Option<StatsFile>,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Result<Self, PipelineError> {
        let mut builder = PoliteClient::builder()
            .timeout(config.timeout)
            .retry_count(config.retry_count)
            .backoff(config.backoff_base, config.backoff_max);
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        let client = builder.build().map_err(PipelineError::Client)?;
        let ids = (!config.page_id_include.is_empty()).then_some(config.page_id_include.as_slice());
        let filter = ContentFilter::new(
            config.page_title_include.as_deref(),
            ids,
            config.page_title_exclude.as_deref(),
        )
        .map_err(|source| PipelineError::Pattern {
            what: "page title",
            source,
        })?;
        let transforms = config
            .transforms
            .iter()
            .filter_map(|spec| {
                let tool = ExternalTool::from_spec(spec);
                if tool.is_none() {
                    warn!(name = %spec.name, "transform without command ignored");
                }
                tool.map(|t| Arc::new(t) as Arc<dyn AssetTransform>)
            })
            .collect();
        let stats = config.stats_file.as_deref().map(StatsFile::new);
        Ok(Self {
            config,
            client,
            filter,
            transforms,
            progress: Arc::new(Progress::new()),
            abort: Arc::new(AtomicBool::new(false)),
            stats,
        })
    }

    /// Replace the configured asset transforms.
    pub fn with_transforms(mut self, transforms: Vec<Arc<dyn AssetTransform>>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Flag that stops every worker at its next item when set.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Discover and filter only; nothing is fetched or written.
    pub async fn plan(&self) -> Result<Plan, PipelineError> {
        let archive_path = self.config.archive_path()?;
        let discovered = self.discover_stage().await?;
        Ok(Plan {
            archive_path,
            library_url: discovered.library.library_url().to_string(),
            root_id: discovered.pages.first().map(|p| p.id.clone()).unwrap_or_default(),
            pages: discovered.pages,
            skipped_listings: discovered.skipped,
        })
    }

    /// Full run publishing the archive at [RunConfig::archive_path].
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let target = self.config.archive_path()?;
        if target.exists() && !self.config.overwrite {
            return Err(PipelineError::ArchiveExists { path: target });
        }
        let collected = self.collect().await?;
        let mut container = ZipContainer::create(&target)?;
        let mut report = self.assemble(collected, &mut container)?;
        report.archive = Some(target);
        Ok(report)
    }

    /// Full run writing into `sink`.
    pub async fn run_into(&self, sink: &mut dyn ArchiveSink) -> Result<RunReport, PipelineError> {
        let collected = self.collect().await?;
        self.assemble(collected, sink)
    }

    async fn collect(&self) -> Result<Collected, PipelineError> {
        let discovered = self.discover_stage().await?;
        self.write_stats();

        let library = Arc::new(discovered.library);
        let known = KnownPages::new(
            library.library_url(),
            discovered.pages.iter().map(|p| p.path.as_str()),
        )?;
        let rewriter = Arc::new(Rewriter::new(known)?);
        let stage = self
            .page_stage(Arc::clone(&library), rewriter, discovered.pages)
            .await?;
        self.write_stats();

        let (mut stylesheets, sheet_references) =
            self.stylesheet_stage(library.library_url(), &discovered.home).await;
        let references = stage
            .pages
            .iter()
            .flat_map(|(_, output)| output.assets.iter().cloned())
            .chain(sheet_references)
            .collect();
        let asset_pipeline = AssetPipeline::new(
            self.client.clone(),
            AssetPipelineConfig {
                asset_concurrency: self.config.asset_concurrency,
                tool_concurrency: self.config.tool_concurrency,
                hash: self.config.hash,
                bad_assets: bad_assets_regex(self.config.bad_assets_regex.as_deref()).map_err(
                    |source| PipelineError::Pattern {
                        what: "bad assets",
                        source,
                    },
                )?,
                bad_assets_threshold: self.config.bad_assets_threshold,
            },
            self.transforms.clone(),
        );
        let mut resolution = asset_pipeline
            .run(references, Arc::clone(&self.abort), Arc::clone(&self.progress))
            .await?;
        self.write_stats();
        if self.abort.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }

        let logo = self.fetch_logo(&discovered.home).await;
        let root_path = stage
            .pages
            .first()
            .map(|(p, _)| p.path.clone())
            .unwrap_or_default();
        let logo_path = if logo.is_some() { LOGO_PATH } else { "" };
        let mut manifest = ManifestBuilder::new(logo_path, &root_path, library.library_url());
        let mut pages = Vec::with_capacity(stage.pages.len());
        let mut warnings = Vec::new();
        for (position, (page, output)) in stage.pages.into_iter().enumerate() {
            manifest.add(position, &page);
            let mut nodes = output.nodes;
            substitute_placeholders(&mut nodes, resolution.resolved(), MISSING_ASSET_PATH);
            let html_body = serialize(&nodes);
            warnings.extend(output.warnings);
            pages.push((
                page,
                PageContent {
                    page_id: output.content.page_id,
                    html_body,
                },
            ));
        }

        // Stylesheets live in content/, next to the assets they reference.
        let sheet_path = |placeholder: &str| -> String {
            let path = resolution
                .resolved()
                .get(placeholder)
                .map_or(MISSING_ASSET_PATH, String::as_str);
            path.strip_prefix("content/").unwrap_or(path).to_string()
        };
        for sheet in &mut stylesheets {
            sheet.css = css::substitute(&sheet.css, &sheet_path);
        }

        let failed_assets = std::mem::take(&mut resolution.failures);
        let assets_stored = resolution.stored_count();
        let metadata = ArchiveMetadata {
            name: self.config.name.clone(),
            title: self.config.title.clone(),
            creator: self.config.creator.clone(),
            publisher: self.config.publisher.clone(),
            description: self.config.description.clone(),
            long_description: self.config.long_description.clone(),
            language: self.config.language.clone(),
            tags: self.config.tags.clone(),
            scraper: format!("mindtouch-zim {}", env!("CARGO_PKG_VERSION")),
            date: self.config.date.clone(),
        };
        Ok(Collected {
            input: AssemblyInput {
                pages,
                stylesheets,
                assets: resolution.into_assets(),
                manifest: Some(manifest.build()),
                logo,
                missing_asset_placeholder: !failed_assets.is_empty(),
                root_aliases: self.config.root_aliases.clone(),
                favicon_alias: self.config.favicon_alias.clone(),
                metadata,
            },
            failed_pages: stage.failed,
            skipped_listings: discovered.skipped,
            failed_assets,
            assets_stored,
            warnings,
        })
    }

    fn assemble(
        &self,
        collected: Collected,
        sink: &mut dyn ArchiveSink,
    ) -> Result<RunReport, PipelineError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }
        let assembly = archive::assemble(sink, collected.input)?;
        self.write_stats();
        let skipped = !collected.failed_pages.is_empty()
            || !collected.skipped_listings.is_empty()
            || !collected.failed_assets.is_empty();
        let state = if skipped {
            RunState::CompletedWithSkips
        } else {
            RunState::Completed
        };
        info!(
            pages = assembly.pages,
            assets = assembly.assets,
            failed_pages = collected.failed_pages.len(),
            failed_assets = collected.failed_assets.len(),
            ?state,
            "archive assembled"
        );
        Ok(RunReport {
            state,
            archive: None,
            pages_written: assembly.pages,
            failed_pages: collected.failed_pages,
            skipped_listings: collected.skipped_listings,
            failed_assets: collected.failed_assets,
            assets_stored: collected.assets_stored,
            warnings: collected.warnings,
            assembly,
        })
    }

    #[instrument(skip(self), fields(library = %self.config.library_url, root = %self.config.root_page_id))]
    async fn discover_stage(&self) -> Result<Discovered, PipelineError> {
        let (library, home) = Library::connect(self.client.clone(), &self.config.library_url)
            .await
            .map_err(PipelineError::Connect)?;
        let progress = Arc::clone(&self.progress);
        let on_level = move |count: usize| progress.discovered(count);
        let options = DiscoveryOptions {
            page_size: self.config.listing_page_size,
            concurrency: self.config.discovery_concurrency,
            progress: Some(&on_level),
        };
        let discovery = mindtouch::discover(&library, &self.config.root_page_id, &options).await?;
        for skipped in &discovery.skipped {
            warn!(error = %skipped, "listing skipped");
        }
        let pages: Vec<Page> = self
            .filter
            .select(&discovery.tree)
            .into_iter()
            .cloned()
            .collect();
        self.progress.set_pages_total(pages.len());
        info!(
            discovered = discovery.tree.len(),
            selected = pages.len(),
            "page tree ready"
        );
        Ok(Discovered {
            library,
            home,
            pages,
            skipped: discovery.skipped,
        })
    }

    async fn page_stage(
        &self,
        library: Arc<Library>,
        rewriter: Arc<Rewriter>,
        pages: Vec<Page>,
    ) -> Result<PageStage, PipelineError> {
        let total = pages.len();
        let semaphore = Arc::new(Semaphore::new(self.config.page_concurrency));
        let mut set = JoinSet::new();
        for (position, page) in pages.iter().cloned().enumerate() {
            let library = Arc::clone(&library);
            let rewriter = Arc::clone(&rewriter);
            let semaphore = Arc::clone(&semaphore);
            let abort = Arc::clone(&self.abort);
            let progress = Arc::clone(&self.progress);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if abort.load(Ordering::SeqCst) {
                    return None;
                }
                let result = fetch_page(&library, &page.id).await.map(|raw| {
                    progress.page_fetched();
                    rewriter.rewrite(&page, &raw.markup)
                });
                Some((position, result))
            });
        }

        let mut outputs: Vec<Option<RewriteOutput>> = (0..total).map(|_| None).collect();
        let mut failed = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (position, result) = match joined {
                Ok(Some(done)) => done,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "page worker panicked");
                    self.abort.store(true, Ordering::SeqCst);
                    continue;
                }
            };
            match result {
                Ok(output) => {
                    for warning in &output.warnings {
                        debug!(%warning, "rewrite warning");
                    }
                    self.progress.page_rewritten();
                    outputs[position] = Some(output);
                }
                Err(err) => {
                    self.progress.page_failed();
                    if pages[position].parent.is_none() {
                        self.abort.store(true, Ordering::SeqCst);
                        return Err(PipelineError::RootPage(err));
                    }
                    warn!(page = %err.page_id, error = %err.source, "page skipped");
                    failed.push(err);
                    if exceeds_threshold(failed.len(), total, self.config.failure_threshold) {
                        self.abort.store(true, Ordering::SeqCst);
                        return Err(PipelineError::TooManyFailures {
                            failed: failed.len(),
                            total,
                            threshold: self.config.failure_threshold,
                        });
                    }
                }
            }
            self.write_stats();
        }
        if self.abort.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }
        failed.sort_by(|a, b| a.page_id.cmp(&b.page_id));
        let pages = pages
            .into_iter()
            .zip(outputs)
            .filter_map(|(page, output)| output.map(|o| (page, o)))
            .collect();
        Ok(PageStage { pages, failed })
    }

    /// Site stylesheets named by the home page, with `url()` references replaced by
    /// placeholders. A stylesheet that cannot be fetched is left out.
    async fn stylesheet_stage(
        &self,
        library_url: &str,
        home: &LibraryHome,
    ) -> (Vec<Stylesheet>, Vec<AssetReference>) {
        let mut sources: Vec<(&str, Url, String)> = Vec::new();
        for (path, url) in [
            (SCREEN_CSS_PATH, home.screen_css_url.as_deref()),
            (PRINT_CSS_PATH, home.print_css_url.as_deref()),
        ] {
            let Some(url) = url else { continue };
            let base = match Url::parse(url) {
                Ok(base) => base,
                Err(e) => {
                    warn!(url, error = %e, "invalid stylesheet URL");
                    continue;
                }
            };
            match self.client.get_with_retry(url, &[]).await {
                Ok(fetched) => {
                    sources.push((path, base, String::from_utf8_lossy(&fetched.body).into_owned()))
                }
                Err(e) => warn!(url, error = %e, "cannot fetch stylesheet"),
            }
        }
        if !home.inline_css.is_empty() {
            match Url::parse(&format!("{}/", library_url)) {
                Ok(base) => sources.push((INLINE_CSS_PATH, base, home.inline_css.join("\n"))),
                Err(e) => warn!(library_url, error = %e, "invalid library URL for inline styles"),
            }
        }

        let mut stylesheets = Vec::with_capacity(sources.len());
        let mut references = Vec::new();
        for (path, base, text) in sources {
            let mut found = Vec::new();
            let css = css::rewrite_urls(&text, &base, &mut found);
            debug!(path, assets = found.len(), "stylesheet rewritten");
            references.extend(found.into_iter().map(|url| AssetReference {
                url,
                page_id: path.to_string(),
            }));
            stylesheets.push(Stylesheet {
                path: path.to_string(),
                css,
            });
        }
        (stylesheets, references)
    }

    /// Logo from `illustration_url` or the library home page. Failures only log.
    async fn fetch_logo(&self, home: &LibraryHome) -> Option<Logo> {
        let url = self
            .config
            .illustration_url
            .as_deref()
            .or(home.logo_url.as_deref())?;
        match self.client.get_with_retry(url, &[]).await {
            Ok(fetched) if !fetched.body.is_empty() => Some(Logo {
                mime_type: fetched.mime_type().unwrap_or_else(|| "image/png".to_string()),
                data: fetched.body,
            }),
            Ok(_) => {
                warn!(url, "logo is empty");
                None
            }
            Err(e) => {
                warn!(url, error = %e, "cannot fetch logo");
                None
            }
        }
    }

    fn write_stats(&self) {
        if let Some(stats) = &self.stats {
            stats.write(&self.progress.snapshot());
        }
    }
}

/// A failed fraction exactly at the threshold is tolerated.
fn exceeds_threshold(failed: usize, total: usize, threshold: f64) -> bool {
    total > 0 && failed as f64 / total as f64 > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_boundary_is_inclusive() {
        assert!(!exceeds_threshold(1, 10, 0.1));
        assert!(exceeds_threshold(2, 10, 0.1));
        assert!(!exceeds_threshold(0, 0, 0.0));
        assert!(exceeds_threshold(1, 3, 0.0));
        assert!(!exceeds_threshold(3, 3, 1.0));
    }

    #[test]
    fn run_state_of_error_is_aborted() {
        let result: Result<RunReport, PipelineError> = Err(PipelineError::Interrupted);
        assert_eq!(RunState::of(&result), RunState::Aborted);
    }
}
