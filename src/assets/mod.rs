//! Asset Pipeline: fetch every referenced binary once, transform, hash and deduplicate.
//!
//! Distinct URLs go into a shared queue drained by a pool of workers. Network fetches and
//! external tool runs are bounded by two independent semaphores. Final archive paths
//! are only assigned once every worker has finished, so they never depend on which
//! worker stored a given hash first.

pub mod dedup;
pub mod transform;

pub use dedup::{DedupStore, HashAlgorithm, Inserted, StoredAsset};
pub use transform::{AssetTransform, ExternalTool, TransformError, TransformSpec, Transformed};

use crate::mindtouch::{FetchError, PoliteClient};
use crate::model::{AssetReference, PageId};
use crate::pipeline::progress::Progress;
use crate::rewrite::placeholder_for;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Archive path of the placeholder shown for assets that could not be fetched.
pub const MISSING_ASSET_PATH: &str = "content/missing-asset.svg";

/// Assets that are known to be unreachable on MindTouch sites.
pub const BUILTIN_BAD_ASSETS: &str = r"https?://a\.mtstatic\.com/@(cache|style)";

/// Permanent failure of one asset.
#[derive(Debug, Error)]
pub enum AssetFetchError {
    #[error("Cannot fetch asset: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cannot transform asset {url}: {source}")]
    Transform {
        url: String,
        #[source]
        source: TransformError,
    },
}

/// Fatal condition of the asset stage.
#[derive(Debug, Error)]
pub enum AssetStageError {
    #[error("{failed} asset(s) failed, more than the allowed {threshold}")]
    TooManyFailures { failed: usize, threshold: usize },

    #[error("Asset stage interrupted")]
    Interrupted,
}

/// One asset that could not be stored, with the pages that reference it.
#[derive(Debug)]
pub struct AssetFailure {
    pub url: String,
    pub pages: Vec<PageId>,
    pub error: AssetFetchError,
    /// False for known-bad URLs, which do not count against the threshold.
    pub counted: bool,
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct AssetPipelineConfig {
    /// Concurrent network fetches.
    pub asset_concurrency: usize,
    /// Concurrent external tool runs.
    pub tool_concurrency: usize,
    pub hash: HashAlgorithm,
    /// URLs whose failures are expected; always includes [BUILTIN_BAD_ASSETS].
    pub bad_assets: Regex,
    /// Counted failures above this abort the run.
    pub bad_assets_threshold: Option<usize>,
}

/// Everything the assembler needs from the asset stage.
#[derive(Debug)]
pub struct AssetResolution {
    store: DedupStore,
    /// placeholder → final archive path, for every stored asset URL.
    resolved: HashMap<String, String>,
    pub failures: Vec<AssetFailure>,
}

impl AssetResolution {
    /// Placeholder → final path map to substitute into page bodies.
    pub fn resolved(&self) -> &HashMap<String, String> {
        &self.resolved
    }

    pub fn stored_count(&self) -> usize {
        self.store.len()
    }

    pub fn counted_failures(&self) -> usize {
        self.failures.iter().filter(|f| f.counted).count()
    }

    /// Consume into archive-ready assets sorted by path.
    pub fn into_assets(self) -> Vec<StoredAsset> {
        self.store.into_sorted()
    }
}

/// Shared state of one pipeline run.
struct WorkerContext {
    client: PoliteClient,
    transforms: Vec<Arc<dyn AssetTransform>>,
    hash: HashAlgorithm,
    store: DedupStore,
    queue: Mutex<VecDeque<String>>,
    network: Semaphore,
    tools: Semaphore,
    abort: Arc<AtomicBool>,
    bad_assets: Regex,
    counted_failures: AtomicUsize,
    threshold: Option<usize>,
    progress: Arc<Progress>,
}

pub struct AssetPipeline {
    client: PoliteClient,
    config: AssetPipelineConfig,
    transforms: Vec<Arc<dyn AssetTransform>>,
}

impl AssetPipeline {
    pub fn new(
        client: PoliteClient,
        config: AssetPipelineConfig,
        transforms: Vec<Arc<dyn AssetTransform>>,
    ) -> Self {
        Self {
            client,
            config,
            transforms,
        }
    }

    /// Fetch, transform and deduplicate every referenced asset.
    ///
    /// References are grouped by URL first, so each URL is fetched once. Stops early
    /// when `abort` is raised or when counted failures exceed the threshold.
    #[instrument(skip_all, fields(references = references.len()))]
    pub async fn run(
        &self,
        references: Vec<AssetReference>,
        abort: Arc<AtomicBool>,
        progress: Arc<Progress>,
    ) -> Result<AssetResolution, AssetStageError> {
        let mut pages_by_url: BTreeMap<String, Vec<PageId>> = BTreeMap::new();
        for r in references {
            let pages = pages_by_url.entry(r.url).or_default();
            if !pages.contains(&r.page_id) {
                pages.push(r.page_id);
            }
        }
        progress.add_assets_total(pages_by_url.len());
        info!(distinct = pages_by_url.len(), "fetching assets");

        let asset_concurrency = self.config.asset_concurrency.max(1);
        let tool_concurrency = self.config.tool_concurrency.max(1);
        let ctx = Arc::new(WorkerContext {
            client: self.client.clone(),
            transforms: self.transforms.clone(),
            hash: self.config.hash,
            store: DedupStore::new(),
            queue: Mutex::new(pages_by_url.keys().cloned().collect()),
            network: Semaphore::new(asset_concurrency),
            tools: Semaphore::new(tool_concurrency),
            abort: Arc::clone(&abort),
            bad_assets: self.config.bad_assets.clone(),
            counted_failures: AtomicUsize::new(0),
            threshold: self.config.bad_assets_threshold,
            progress,
        });

        // Enough workers to keep the network busy while others wait on tools.
        let workers = (asset_concurrency + tool_concurrency).min(pages_by_url.len().max(1));
        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(Arc::clone(&ctx)));
        }
        let mut outcomes: Vec<(String, Result<String, AssetFetchError>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => outcomes.extend(results),
                Err(e) => {
                    warn!(error = %e, "asset worker panicked");
                    abort.store(true, Ordering::SeqCst);
                }
            }
        }

        let failed = ctx.counted_failures.load(Ordering::SeqCst);
        if let Some(threshold) = ctx.threshold {
            if failed > threshold {
                return Err(AssetStageError::TooManyFailures { failed, threshold });
            }
        }
        if abort.load(Ordering::SeqCst) {
            return Err(AssetStageError::Interrupted);
        }
        let ctx = Arc::try_unwrap(ctx).map_err(|_| AssetStageError::Interrupted)?;

        let mut resolved = HashMap::new();
        let mut failures = Vec::new();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        for (url, outcome) in outcomes {
            match outcome {
                Ok(hash) => {
                    if let Some(path) = ctx.store.final_path(&hash) {
                        resolved.insert(placeholder_for(&url), path);
                    }
                }
                Err(error) => {
                    let counted = !ctx.bad_assets.is_match(&url);
                    let pages = pages_by_url.remove(&url).unwrap_or_default();
                    failures.push(AssetFailure {
                        url,
                        pages,
                        error,
                        counted,
                    });
                }
            }
        }
        info!(
            stored = ctx.store.len(),
            failed = failures.len(),
            "assets resolved"
        );
        Ok(AssetResolution {
            store: ctx.store,
            resolved,
            failures,
        })
    }
}

async fn worker(ctx: Arc<WorkerContext>) -> Vec<(String, Result<String, AssetFetchError>)> {
    let mut results = Vec::new();
    loop {
        if ctx.abort.load(Ordering::SeqCst) {
            break;
        }
        let Some(url) = ctx.queue.lock().await.pop_front() else {
            break;
        };
        let outcome = process(&ctx, &url).await;
        if let Err(e) = &outcome {
            if ctx.bad_assets.is_match(&url) {
                debug!(url, error = %e, "known bad asset failed");
            } else {
                warn!(url, error = %e, "asset failed");
                let failed = ctx.counted_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if ctx.threshold.is_some_and(|t| failed > t) {
                    ctx.abort.store(true, Ordering::SeqCst);
                }
            }
        }
        ctx.progress.asset_resolved();
        results.push((url, outcome));
    }
    results
}

async fn process(ctx: &WorkerContext, url: &str) -> Result<String, AssetFetchError> {
    let fetched = {
        let _permit = ctx.network.acquire().await.map_err(|_| FetchError::InvalidResponse {
            url: url.to_string(),
            reason: "network permits closed".to_string(),
        })?;
        // Known-bad URLs get a single attempt.
        let attempts = if ctx.bad_assets.is_match(url) {
            1
        } else {
            ctx.client.retry_count()
        };
        ctx.client.get_with_attempts(url, &[], attempts).await?
    };
    let mut content_type = fetched
        .mime_type()
        .filter(|ct| ct != "application/octet-stream")
        .or_else(|| dedup::guess_content_type(url).map(String::from));
    let mut bytes = fetched.body;

    let tool = ctx
        .transforms
        .iter()
        .find(|t| t.applies_to(url, content_type.as_deref()))
        .cloned();
    if let Some(tool) = tool {
        let transform_error = |source| AssetFetchError::Transform {
            url: url.to_string(),
            source,
        };
        let _permit = ctx.tools.acquire().await.map_err(|_| {
            transform_error(TransformError::Crashed {
                tool: tool.name().to_string(),
                reason: "tool permits closed".to_string(),
            })
        })?;
        let name = tool.name().to_string();
        let transformed = tokio::task::spawn_blocking(move || tool.transform(bytes))
            .await
            .map_err(|e| {
                transform_error(TransformError::Crashed {
                    tool: name,
                    reason: e.to_string(),
                })
            })?
            .map_err(transform_error)?;
        bytes = transformed.bytes;
        if transformed.content_type.is_some() {
            content_type = transformed.content_type;
        }
    }

    let hash = ctx.hash.digest(&bytes);
    let inserted = ctx.store.insert(&hash, bytes, content_type, url);
    debug!(url, %hash, ?inserted, "asset stored");
    Ok(hash)
}

/// Compile the user's bad-asset pattern together with [BUILTIN_BAD_ASSETS], case-insensitive.
pub fn bad_assets_regex(user: Option<&str>) -> Result<Regex, regex::Error> {
    match user {
        Some(pattern) if !pattern.trim().is_empty() => {
            Regex::new(&format!("(?i)(?:{})|(?:{})", pattern, BUILTIN_BAD_ASSETS))
        }
        _ => Regex::new(&format!("(?i){}", BUILTIN_BAD_ASSETS)),
    }
}

/// Placeholder image written at [MISSING_ASSET_PATH].
pub const MISSING_ASSET_SVG: &str = concat!(
    r##"<svg xmlns="http://www.w3.org/2000/svg" width="120" height="90" viewBox="0 0 120 90">"##,
    r##"<rect width="120" height="90" fill="#eeeeee" stroke="#999999"/>"##,
    r##"<text x="60" y="50" font-family="sans-serif" font-size="12" text-anchor="middle" fill="#666666">missing asset</text>"##,
    "</svg>"
);
