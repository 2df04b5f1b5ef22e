//! End-to-end pipeline tests: manifest → fetch → package, the dual-profile
//! build, and resume via the on-disk existence check.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::json;
use skillshelf::config::{EpubFormat, JobConfig};
use skillshelf::epub::verify_package;
use skillshelf::job::JobController;
use skillshelf::naming::{book_folder_name, epub_file_name, topic_folder_name};
use skillshelf::progress::SessionStatus;
use skillshelf::Profile;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOOK_ID: &str = "9781492052586";

/// Mounts a complete two-chapter book on the mock provider.
async fn mount_book(server: &MockServer) {
    let uri = server.uri();

    Mock::given(method("GET"))
        .and(path("/profile/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("profile"))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/book/{BOOK_ID}/")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "title": "Programming Rust",
            "authors": [{"name": "Jim Blandy"}, {"name": "Jason Orendorff"}],
            "publishers": [{"name": "Example Media"}],
            "isbn": BOOK_ID,
            "description": "Fast, safe systems development.",
            "subjects": [{"name": "Rust"}],
            "rights": "All rights reserved.",
            "issued": "2021-06-11",
            "web_url": format!("{uri}/library/view/x/{BOOK_ID}/"),
            "cover_url": format!("{uri}/covers/{BOOK_ID}.jpg"),
            "chapter_list": format!("{uri}/api/v1/book/{BOOK_ID}/chapter/")
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/book/{BOOK_ID}/chapter/")))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "next": null,
            "results": [
                {
                    "filename": "ch01.html",
                    "title": "Systems Programmers Can Have Nice Things",
                    "content": format!("{uri}/content/ch01.html"),
                    "asset_base_url": format!("{uri}/files/"),
                    "images": ["images/fig1.png"],
                    "stylesheets": [{"url": format!("{uri}/files/style.css")}]
                },
                {
                    "filename": "ch02.html",
                    "title": "A Tour of Rust",
                    "content": format!("{uri}/content/ch02.html"),
                    "asset_base_url": format!("{uri}/files/"),
                    "images": [],
                    "stylesheets": [{"url": format!("{uri}/files/style.css")}]
                }
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/content/ch01.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><div id="sbo-rt-content">
               <h1>Systems Programmers Can Have Nice Things</h1>
               <p>Rust &amp; reliability.</p>
               <img src="images/fig1.png" alt="figure">
               <p>See <a href="ch02.html#tour">the tour</a>.</p>
               </div></body></html>"#,
        ))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/content/ch02.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><div id="sbo-rt-content">
               <h1 id="tour">A Tour of Rust</h1>
               <p>Types, ownership, borrowing.</p>
               </div></body></html>"#,
        ))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/style.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("p { margin: 0; } body { background: url(images/bg.png); }"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/images/fig1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89u8; 64]))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/images/bg.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89u8; 32]))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/covers/{BOOK_ID}.jpg")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFFu8; 2048]))
        .mount(server)
        .await;
}

/// Writes the topic manifest discovery would have produced.
fn seed_manifest(dir: &TempDir, uri: &str) {
    std::fs::create_dir_all(dir.path().join("book_ids")).unwrap();
    std::fs::write(
        dir.path().join("book_ids/rust_books.json"),
        serde_json::to_vec_pretty(&json!({
            "skill_name": "Rust",
            "discovery_timestamp": "2026-07-01T00:00:00Z",
            "total_books": 1,
            "books": [{
                "title": "Programming Rust",
                "id": BOOK_ID,
                "url": format!("{uri}/api/v1/book/{BOOK_ID}/"),
                "isbn": BOOK_ID,
                "format": "book"
            }]
        }))
        .unwrap(),
    )
    .unwrap();
}

fn test_config(dir: &TempDir, uri: &str, format: EpubFormat) -> JobConfig {
    let cookie_path = dir.path().join("cookies.json");
    if !cookie_path.exists() {
        let mut jar = BTreeMap::new();
        jar.insert("session_token".to_string(), "seed".to_string());
        std::fs::write(&cookie_path, serde_json::to_vec(&jar).unwrap()).unwrap();
    }

    JobConfig {
        base_url: uri.to_string(),
        cookies_file: cookie_path,
        base_directory: dir.path().join("books_by_skills"),
        book_ids_directory: dir.path().join("book_ids"),
        progress_file: dir.path().join("output/progress.json"),
        epub_format: format,
        discovery_delay: 0.0,
        download_delay: 0.0,
        session_reuse_delay: 0.0,
        ..JobConfig::default()
    }
}

fn book_dir(dir: &TempDir) -> std::path::PathBuf {
    dir.path()
        .join("books_by_skills")
        .join(topic_folder_name("Rust"))
        .join(book_folder_name("Programming Rust", BOOK_ID))
}

// ==================== Scenario S6: dual-profile build ====================

#[tokio::test]
async fn test_download_builds_dual_profiles_sharing_one_tree() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Dual)).unwrap();
    let summary = controller.run_download(None).await.unwrap();

    assert_eq!(summary.books_completed, 1);
    assert_eq!(summary.books_failed, 0);
    assert_eq!(summary.exit_code(), 0);

    let book_dir = book_dir(&dir);
    let standard = book_dir.join(epub_file_name(
        "Programming Rust",
        "Jim Blandy",
        Profile::Standard,
    ));
    let kindle = book_dir.join(epub_file_name(
        "Programming Rust",
        "Jim Blandy",
        Profile::Kindle,
    ));
    assert!(standard.is_file(), "missing {}", standard.display());
    assert!(kindle.is_file(), "missing {}", kindle.display());

    // Exactly two packages, one shared OEBPS tree.
    let epubs: Vec<_> = std::fs::read_dir(&book_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".epub"))
        .collect();
    assert_eq!(epubs.len(), 2);
    assert!(book_dir.join("OEBPS/ch01.xhtml").is_file());
    assert!(book_dir.join("OEBPS/ch02.xhtml").is_file());
    assert!(book_dir.join("OEBPS/Images/fig1.png").is_file());
    assert!(book_dir.join("OEBPS/Images/bg.png").is_file());
    assert!(
        book_dir
            .join(format!("OEBPS/Images/cover_{BOOK_ID}.jpg"))
            .is_file()
    );
    assert!(book_dir.join("OEBPS/Styles/Style00.css").is_file());
    assert!(book_dir.join("metadata.json").is_file());

    // Both containers pass the structural check.
    verify_package(&standard, &[]).unwrap();
    verify_package(&kindle, &[]).unwrap();

    // The chapter link rewrite kept the cross-chapter fragment.
    let ch01 = std::fs::read_to_string(book_dir.join("OEBPS/ch01.xhtml")).unwrap();
    assert!(ch01.contains("href=\"ch02.xhtml#tour\""), "ch01: {ch01}");
    assert!(ch01.contains("src=\"Images/fig1.png\""), "ch01: {ch01}");
    assert!(ch01.contains("Styles/Style00.css"), "ch01: {ch01}");

    // The stylesheet's CSS image ref was rewritten into the package.
    let css = std::fs::read_to_string(book_dir.join("OEBPS/Styles/Style00.css")).unwrap();
    assert!(css.contains("url(../Images/bg.png)"), "css: {css}");
}

// ==================== Scenario S5: resume via existence check ====================

#[tokio::test]
async fn test_second_run_skips_existing_book_with_probe_only() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let config = test_config(&dir, &server.uri(), EpubFormat::Dual);

    let mut controller = JobController::new(config.clone()).unwrap();
    let first = controller.run_download(None).await.unwrap();
    assert_eq!(first.books_completed, 1);

    let requests_after_first = server.received_requests().await.unwrap().len();

    // Identical config, fresh controller: the existence check must skip
    // the book with no requests beyond the auth probe.
    let mut controller = JobController::new(config).unwrap();
    let second = controller.run_download(None).await.unwrap();
    assert_eq!(second.books_completed, 0);
    assert_eq!(second.books_skipped, 1);
    assert_eq!(second.exit_code(), 0);

    let requests_after_second = server.received_requests().await.unwrap().len();
    assert_eq!(
        requests_after_second,
        requests_after_first + 1,
        "second run must issue only the auth probe"
    );

    // The tracker counts the skipped book as complete.
    assert_eq!(controller.tracker().state().completed_books, 1);
}

#[tokio::test]
async fn test_missing_profile_file_reschedules_book() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let config = test_config(&dir, &server.uri(), EpubFormat::Dual);
    let mut controller = JobController::new(config.clone()).unwrap();
    controller.run_download(None).await.unwrap();

    // Losing one of the two dual-profile files makes the book absent.
    let kindle = book_dir(&dir).join(epub_file_name(
        "Programming Rust",
        "Jim Blandy",
        Profile::Kindle,
    ));
    std::fs::remove_file(&kindle).unwrap();

    let mut controller = JobController::new(config).unwrap();
    let summary = controller.run_download(None).await.unwrap();
    assert_eq!(summary.books_completed, 1, "book must be re-downloaded");
    assert!(kindle.is_file());
}

#[tokio::test]
async fn test_force_redownload_ignores_existing_files() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let config = test_config(&dir, &server.uri(), EpubFormat::Kindle);
    let mut controller = JobController::new(config.clone()).unwrap();
    controller.run_download(None).await.unwrap();

    let config = JobConfig {
        force_redownload: true,
        ..config
    };
    let mut controller = JobController::new(config).unwrap();
    let summary = controller.run_download(None).await.unwrap();
    assert_eq!(summary.books_skipped, 0);
    assert_eq!(summary.books_completed, 1);
}

// ==================== Single-profile build ====================

#[tokio::test]
async fn test_kindle_format_builds_one_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Kindle)).unwrap();
    controller.run_download(None).await.unwrap();

    let book_dir = book_dir(&dir);
    assert!(
        book_dir
            .join(epub_file_name(
                "Programming Rust",
                "Jim Blandy",
                Profile::Kindle
            ))
            .is_file()
    );
    assert!(
        !book_dir
            .join(epub_file_name(
                "Programming Rust",
                "Jim Blandy",
                Profile::Standard
            ))
            .is_file()
    );
}

// ==================== Auth failure aborts the job ====================

#[tokio::test]
async fn test_dead_session_aborts_with_auth_error() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    seed_manifest(&dir, &server.uri());

    Mock::given(method("GET"))
        .and(path("/profile/"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Dual)).unwrap();
    let err = controller.run_download(None).await.unwrap_err();
    assert_eq!(err.exit_code(), 1, "got: {err}");
}

// ==================== Interrupt semantics ====================

#[tokio::test]
async fn test_interrupt_flag_pauses_session() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Dual)).unwrap();
    controller
        .interrupt_flag()
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let summary = controller.run_download(None).await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(summary.books_completed, 0);
    assert_eq!(
        controller.tracker().state().status,
        SessionStatus::Paused
    );
}

// ==================== Per-book failure is not fatal ====================

#[tokio::test]
async fn test_failed_book_recorded_and_run_continues() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/profile/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // Book info endpoint is permanently broken.
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/book/{BOOK_ID}/")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    seed_manifest(&dir, &server.uri());

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Dual)).unwrap();
    let summary = controller.run_download(None).await.unwrap();

    assert_eq!(summary.books_completed, 0);
    assert_eq!(summary.books_failed, 1);
    assert_eq!(summary.exit_code(), 3, "partial success");

    let state = controller.tracker().state();
    assert_eq!(state.failed_items.len(), 1);
    assert_eq!(state.failed_items.get(BOOK_ID).unwrap().kind, "http");

    // The summary file lists the failure.
    let summary_text =
        std::fs::read_to_string(dir.path().join("output/download_summary.txt")).unwrap();
    assert!(summary_text.contains(BOOK_ID), "summary: {summary_text}");
    assert!(summary_text.contains("[http]"), "summary: {summary_text}");
}

// ==================== Idempotent progress serialization ====================

#[tokio::test]
async fn test_progress_survives_reload_structurally_equal() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let config = test_config(&dir, &server.uri(), EpubFormat::Dual);
    let mut controller = JobController::new(config.clone()).unwrap();
    controller.run_download(None).await.unwrap();

    let raw_first = std::fs::read_to_string(dir.path().join("output/progress.json")).unwrap();
    let first: serde_json::Value = serde_json::from_str(&raw_first).unwrap();
    assert_eq!(first["completed_books"], 1);
    assert_eq!(first["status"], "completed");
    assert_eq!(first["completed_items"][0], BOOK_ID);
    assert_eq!(first["schema_version"], 2);
}

#[tokio::test]
async fn test_dead_session_mid_book_aborts() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    seed_manifest(&dir, &server.uri());

    Mock::given(method("GET"))
        .and(path("/profile/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // The session dies on the book-info endpoint.
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/book/{BOOK_ID}/")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut controller =
        JobController::new(test_config(&dir, &server.uri(), EpubFormat::Dual)).unwrap();
    let err = controller.run_download(None).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);

    // The failed session state is persisted for the operator.
    let raw = std::fs::read_to_string(dir.path().join("output/progress.json")).unwrap();
    assert!(raw.contains("\"failed\""), "progress: {raw}");
}

// ==================== Existence check stays advisory-proof ====================

#[tokio::test]
async fn test_deleted_progress_file_does_not_cause_redownload() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_book(&server).await;
    seed_manifest(&dir, &server.uri());

    let config = test_config(&dir, &server.uri(), EpubFormat::Dual);
    let mut controller = JobController::new(config.clone()).unwrap();
    controller.run_download(None).await.unwrap();

    // Losing the progress file must not trigger re-downloads: the file
    // system is the authority.
    std::fs::remove_file(dir.path().join("output/progress.json")).unwrap();

    let before = server.received_requests().await.unwrap().len();
    let mut controller = JobController::new(config).unwrap();
    let summary = controller.run_download(None).await.unwrap();
    assert_eq!(summary.books_skipped, 1);
    let after = server.received_requests().await.unwrap().len();
    assert_eq!(after, before + 1, "probe only");
}

// ==================== Path sanity ====================

#[test]
fn test_output_layout_names() {
    assert_eq!(topic_folder_name("Rust"), "Rust");
    assert_eq!(
        book_folder_name("Programming Rust", BOOK_ID),
        format!("Programming Rust ({BOOK_ID})")
    );
    assert_eq!(
        Path::new(&epub_file_name("Programming Rust", "Jim Blandy", Profile::Kindle))
            .extension()
            .unwrap(),
        "epub"
    );
}
