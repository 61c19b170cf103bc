//! End-to-end runs against a mock library.

mod support;

use mindtouch_zim::archive::{EntryBody, MemorySink, LOGO_PATH, MANIFEST_PATH};
use mindtouch_zim::assets::{
    AssetStageError, AssetTransform, TransformError, Transformed, MISSING_ASSET_PATH,
};
use mindtouch_zim::config::Config;
use mindtouch_zim::mindtouch::FetchError;
use mindtouch_zim::model::{LibraryManifest, PageContentPayload};
use mindtouch_zim::{HashAlgorithm, Pipeline, PipelineError, RunState};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{resolve, settings, MockLibrary, PNG};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Root 28207 with two books. Both the root and the first book embed the same image
/// bytes under different URLs; the first book also embeds an image that is gone.
async fn geo_library() -> MockLibrary {
    let lib = MockLibrary::start().await;
    let uri = lib.uri();
    lib.home().await;
    lib.page_info("28207", "Geosciences", "Bookshelves").await;
    lib.children(
        "28207",
        &[
            ("100", "Physical Geology", "Bookshelves/Physical_Geology"),
            ("200", "Oceanography", "Bookshelves/Oceanography"),
        ],
    )
    .await;
    lib.leaves().await;
    lib.contents(
        "28207",
        &format!(
            r#"<p>Welcome</p><a href="{}/Bookshelves/Oceanography">Oceans</a><img src="/@api/deki/files/1/rock.png">"#,
            uri
        ),
    )
    .await;
    lib.contents(
        "100",
        r#"<img src="/@api/deki/files/2/rock-copy.png"><img src="/img/broken.png">"#,
    )
    .await;
    lib.contents("200", "<nav>menu</nav><p>Waves</p>").await;
    lib.file("/@api/deki/files/1/rock.png", PNG, "image/png").await;
    lib.file("/@api/deki/files/2/rock-copy.png", PNG, "image/png").await;
    lib.status("/img/broken.png", 404).await;
    lib
}

fn read_entry(archive: &Path, name: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut zip = zip::ZipArchive::new(std::fs::File::open(archive)?)?;
    let mut data = Vec::new();
    zip.by_name(name)?.read_to_end(&mut data)?;
    Ok(data)
}

fn page_body(archive: &Path, id: &str) -> Result<String, Box<dyn std::error::Error>> {
    let data = read_entry(archive, &format!("content/page_content_{}.json", id))?;
    let payload: PageContentPayload = serde_json::from_slice(&data)?;
    Ok(payload.html_body)
}

#[tokio::test]
async fn geo_library_is_archived() -> TestResult {
    let lib = geo_library().await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(settings(&lib, out.path())))?;
    let report = pipeline.run().await?;

    let archive = out.path().join("geo_libretexts.org_en_geo.zim");
    assert_eq!(report.archive.as_deref(), Some(archive.as_path()));
    assert_eq!(report.state, RunState::CompletedWithSkips);
    assert_eq!(report.pages_written, 3);
    assert!(report.failed_pages.is_empty());

    // Byte-identical images under two URLs are stored once.
    assert_eq!(report.assets_stored, 1);
    let asset_path = format!("content/assets/{}.png", HashAlgorithm::Sha256.digest(PNG));
    assert_eq!(read_entry(&archive, &asset_path)?, PNG);

    // The vanished image is the single failed asset.
    assert_eq!(report.failed_assets.len(), 1);
    assert!(report.failed_assets[0].url.ends_with("/img/broken.png"));
    assert_eq!(report.failed_assets[0].pages, vec!["100".to_string()]);

    let manifest: LibraryManifest = serde_json::from_slice(&read_entry(&archive, MANIFEST_PATH)?)?;
    assert_eq!(manifest.root_page_path, "Bookshelves");
    assert_eq!(manifest.library_online_url, lib.uri());
    assert_eq!(manifest.logo_path, LOGO_PATH);
    let ids: Vec<&str> = manifest.pages.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["28207", "100", "200"]);

    let root = page_body(&archive, "28207")?;
    assert!(root.contains(r##"href="#/Bookshelves/Oceanography""##), "{}", root);
    assert!(!root.contains(&format!("{}/Bookshelves/Oceanography", lib.uri())));
    assert!(root.contains(&format!(r#"src="{}""#, asset_path)));

    let geology = page_body(&archive, "100")?;
    assert!(geology.contains(&format!(r#"src="{}""#, asset_path)));
    assert!(geology.contains(&format!(r#"src="{}""#, MISSING_ASSET_PATH)));
    assert!(!geology.contains("_pending"));
    assert!(!read_entry(&archive, MISSING_ASSET_PATH)?.is_empty());

    assert_eq!(page_body(&archive, "200")?, "<p>Waves</p>");
    assert_eq!(read_entry(&archive, LOGO_PATH)?, support::LOGO);
    assert_eq!(read_entry(&archive, "M/Name")?, b"libretexts.org_en_geo");
    Ok(())
}

#[tokio::test]
async fn two_runs_produce_identical_archives() -> TestResult {
    let lib = geo_library().await;
    let first = tempfile::tempdir()?;
    let second = tempfile::tempdir()?;
    for dir in [&first, &second] {
        Pipeline::new(resolve(settings(&lib, dir.path())))?
            .run()
            .await?;
    }
    let name = "geo_libretexts.org_en_geo.zim";
    assert_eq!(
        std::fs::read(first.path().join(name))?,
        std::fs::read(second.path().join(name))?
    );
    Ok(())
}

#[tokio::test]
async fn existing_archive_is_kept_without_overwrite() -> TestResult {
    let lib = MockLibrary::start().await;
    let out = tempfile::tempdir()?;
    let archive = out.path().join("geo_libretexts.org_en_geo.zim");
    std::fs::write(&archive, b"previous build")?;

    let result = Pipeline::new(resolve(settings(&lib, out.path())))?.run().await;
    assert!(matches!(result, Err(PipelineError::ArchiveExists { .. })));
    assert_eq!(std::fs::read(&archive)?, b"previous build");
    let requests = lib.server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty(), "no network work before the check");
    Ok(())
}

/// Root plus nine children; the children listed in `failing` return 404 for their contents.
async fn wide_library(failing: &[&str]) -> MockLibrary {
    let lib = MockLibrary::start().await;
    lib.home().await;
    lib.page_info("28207", "Geosciences", "Bookshelves").await;
    let ids: Vec<String> = (1..=9).map(|n| n.to_string()).collect();
    let titles: Vec<String> = ids.iter().map(|id| format!("Book {}", id)).collect();
    let paths: Vec<String> = ids.iter().map(|id| format!("Bookshelves/Book_{}", id)).collect();
    let children: Vec<(&str, &str, &str)> = (0..ids.len())
        .map(|i| (ids[i].as_str(), titles[i].as_str(), paths[i].as_str()))
        .collect();
    lib.children("28207", &children).await;
    lib.leaves().await;
    for id in failing {
        lib.status(&format!("/@api/deki/pages/{}/contents", id), 404).await;
    }
    lib.default_contents().await;
    lib
}

#[tokio::test]
async fn failures_at_the_threshold_are_tolerated() -> TestResult {
    let lib = wide_library(&["4"]).await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(Config {
        failure_threshold: Some(0.1),
        ..settings(&lib, out.path())
    }))?;
    let mut sink = MemorySink::new();
    let report = pipeline.run_into(&mut sink).await?;

    assert_eq!(report.state, RunState::CompletedWithSkips);
    assert_eq!(report.pages_written, 9);
    assert_eq!(report.failed_pages.len(), 1);
    assert_eq!(report.failed_pages[0].page_id, "4");
    assert!(sink.is_finalized());
    assert!(sink.get("content/page_content_4.json").is_none());

    let manifest = match sink.get(MANIFEST_PATH).map(|e| &e.body) {
        Some(EntryBody::Content { data, .. }) => serde_json::from_slice::<LibraryManifest>(data)?,
        other => panic!("manifest missing: {:?}", other),
    };
    assert_eq!(manifest.pages.len(), 9);
    assert!(manifest.pages.iter().all(|p| p.id != "4"));
    Ok(())
}

#[tokio::test]
async fn failures_above_the_threshold_abort() -> TestResult {
    let lib = wide_library(&["4", "7"]).await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(Config {
        failure_threshold: Some(0.1),
        ..settings(&lib, out.path())
    }))?;
    let result = pipeline.run().await;

    assert_eq!(RunState::of(&result), RunState::Aborted);
    match result {
        Err(PipelineError::TooManyFailures { failed, total, .. }) => {
            assert_eq!((failed, total), (2, 10));
        }
        other => panic!("unexpected: {:?}", other),
    }
    // No archive and no temporary leftovers.
    assert_eq!(std::fs::read_dir(out.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn failing_root_page_is_fatal() -> TestResult {
    let lib = wide_library(&["28207"]).await;
    let out = tempfile::tempdir()?;
    let result = Pipeline::new(resolve(Config {
        failure_threshold: Some(1.0),
        ..settings(&lib, out.path())
    }))?
    .run()
    .await;
    assert!(matches!(result, Err(PipelineError::RootPage(ref e)) if e.page_id == "28207"));
    assert_eq!(std::fs::read_dir(out.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn transient_page_failure_respects_retry_ceiling() -> TestResult {
    let lib = wide_library(&[]).await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/@api/deki/pages/5/contents"))
        .respond_with(wiremock::ResponseTemplate::new(503))
        .with_priority(1)
        .expect(3)
        .mount(&lib.server)
        .await;
    let out = tempfile::tempdir()?;
    let report = Pipeline::new(resolve(Config {
        retry_count: Some(3),
        failure_threshold: Some(0.5),
        ..settings(&lib, out.path())
    }))?
    .run()
    .await?;

    assert_eq!(report.failed_pages.len(), 1);
    match &report.failed_pages[0].source {
        FetchError::Exhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected: {:?}", other),
    }
    lib.server.verify().await;
    Ok(())
}

#[tokio::test]
async fn title_filter_keeps_ancestors() -> TestResult {
    let lib = wide_library(&[]).await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(Config {
        page_title_include: Some("^book 3$".to_string()),
        ..settings(&lib, out.path())
    }))?;
    let plan = pipeline.plan().await?;
    let ids: Vec<&str> = plan.pages.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["28207", "3"]);
    assert_eq!(plan.root_id, "28207");
    assert_eq!(
        plan.archive_path,
        out.path().join("geo_libretexts.org_en_geo.zim")
    );
    assert!(!plan.archive_path.exists());
    Ok(())
}

/// Root page only, with `markup` as its contents.
async fn single_page_library(markup: &str) -> MockLibrary {
    let lib = MockLibrary::start().await;
    lib.home().await;
    lib.page_info("28207", "Geosciences", "Bookshelves").await;
    lib.leaves().await;
    lib.contents("28207", markup).await;
    lib
}

fn sink_text(sink: &MemorySink, path: &str) -> String {
    match sink.get(path).map(|e| &e.body) {
        Some(EntryBody::Content { data, .. }) => String::from_utf8_lossy(data).into_owned(),
        other => panic!("{} missing: {:?}", path, other),
    }
}

#[tokio::test]
async fn asset_failures_above_the_threshold_abort() -> TestResult {
    let lib = geo_library().await;
    let out = tempfile::tempdir()?;
    let result = Pipeline::new(resolve(Config {
        bad_assets_threshold: Some(0),
        ..settings(&lib, out.path())
    }))?
    .run()
    .await;

    assert!(matches!(
        result,
        Err(PipelineError::Assets(AssetStageError::TooManyFailures {
            failed: 1,
            threshold: 0
        }))
    ));
    assert_eq!(std::fs::read_dir(out.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn known_bad_asset_is_tried_once_and_not_counted() -> TestResult {
    let lib = single_page_library(r#"<p>Map</p><img src="/cdn/flaky/map.png">"#).await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/cdn/flaky/map.png"))
        .respond_with(wiremock::ResponseTemplate::new(503))
        .with_priority(1)
        .expect(1)
        .mount(&lib.server)
        .await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(Config {
        retry_count: Some(3),
        bad_assets_regex: Some("/flaky/".to_string()),
        bad_assets_threshold: Some(0),
        ..settings(&lib, out.path())
    }))?;
    let mut sink = MemorySink::new();
    let report = pipeline.run_into(&mut sink).await?;

    assert_eq!(report.state, RunState::CompletedWithSkips);
    assert_eq!(report.failed_assets.len(), 1);
    assert!(!report.failed_assets[0].counted);
    assert!(sink_text(&sink, "content/page_content_28207.json").contains(MISSING_ASSET_PATH));
    lib.server.verify().await;
    Ok(())
}

/// Replaces every image by the same bytes.
#[derive(Debug)]
struct Flatten;

impl AssetTransform for Flatten {
    fn name(&self) -> &str {
        "flatten"
    }

    fn applies_to(&self, _url: &str, content_type: Option<&str>) -> bool {
        content_type == Some("image/png")
    }

    fn transform(&self, _input: Vec<u8>) -> Result<Transformed, TransformError> {
        Ok(Transformed {
            bytes: b"flat".to_vec(),
            content_type: None,
        })
    }
}

#[tokio::test]
async fn transformed_assets_are_deduplicated_after_transform() -> TestResult {
    let lib = single_page_library(
        r#"<img src="/@api/deki/files/1/a.png"><img src="/@api/deki/files/2/b.png">"#,
    )
    .await;
    lib.file("/@api/deki/files/1/a.png", PNG, "image/png").await;
    lib.file("/@api/deki/files/2/b.png", support::LOGO, "image/png").await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(settings(&lib, out.path())))?
        .with_transforms(vec![Arc::new(Flatten) as Arc<dyn AssetTransform>]);
    let mut sink = MemorySink::new();
    let report = pipeline.run_into(&mut sink).await?;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.assets_stored, 1);
    let asset_path = format!("content/assets/{}.png", HashAlgorithm::Sha256.digest(b"flat"));
    assert_eq!(sink_text(&sink, &asset_path), "flat");
    let body = sink_text(&sink, "content/page_content_28207.json");
    assert_eq!(body.matches(asset_path.as_str()).count(), 2);
    Ok(())
}

#[tokio::test]
async fn raised_abort_flag_interrupts_the_run() -> TestResult {
    let lib = wide_library(&[]).await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(settings(&lib, out.path())))?;
    pipeline.abort_handle().store(true, Ordering::SeqCst);
    let result = pipeline.run().await;

    assert!(matches!(result, Err(PipelineError::Interrupted)));
    assert_eq!(RunState::of(&result), RunState::Aborted);
    assert_eq!(std::fs::read_dir(out.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn site_stylesheets_reference_archived_assets() -> TestResult {
    let lib = MockLibrary::start().await;
    lib.home_with_styles(
        "body { background: url(../img/dot.png) } .logo { background: url(data:image/png;base64,AA) }",
        ".note { background: url('/img/dot.png') }",
    )
    .await;
    lib.page_info("28207", "Geosciences", "Bookshelves").await;
    lib.leaves().await;
    lib.contents(
        "28207",
        r#"<p style="background: url(/img/dot.png)">Dots</p>"#,
    )
    .await;
    lib.file("/img/dot.png", PNG, "image/png").await;
    let out = tempfile::tempdir()?;
    let pipeline = Pipeline::new(resolve(settings(&lib, out.path())))?;
    let mut sink = MemorySink::new();
    let report = pipeline.run_into(&mut sink).await?;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.assets_stored, 1);
    let hash = HashAlgorithm::Sha256.digest(PNG);
    let screen = sink_text(&sink, "content/screen.css");
    assert!(screen.contains(&format!(r#"url("assets/{}.png")"#, hash)), "{}", screen);
    assert!(screen.contains("url(data:image/png;base64,AA)"));
    let inline = sink_text(&sink, "content/inline.css");
    assert!(inline.contains(&format!(r#"url("assets/{}.png")"#, hash)), "{}", inline);
    assert!(sink.get("content/print.css").is_none());

    let body = sink_text(&sink, "content/page_content_28207.json");
    assert!(body.contains(&format!("content/assets/{}.png", hash)), "{}", body);
    assert!(!body.contains("_pending"));
    Ok(())
}
