//! End-to-end tests driving `GitGateway` through the in-memory transport against real
//! directories. Tests that need a `git` binary skip themselves when none is installed.

use std::{
    fs,
    path::Path,
    process::Command,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::http::{StatusCode, Version, header};
use git_gateway::{
    Event, EventKind, GatewayConfig, GitGateway, Module, Mux, Output, ServiceType,
    transport::memory::{MemoryInput, MemoryOutput},
};
use tempfile::TempDir;

const LOOSE_DIR: &str = "ab";
const LOOSE_FILE: &str = "cdef0123456789abcdef0123456789abcdef01";
const PACK_ID: &str = "0123456789abcdef0123456789abcdef01234567";

/// A project root holding one repository directory `r.git` with a few object files.
fn fixture() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let repo = root.path().join("r.git");
    fs::create_dir_all(repo.join("objects").join(LOOSE_DIR)).unwrap();
    fs::create_dir_all(repo.join("objects/pack")).unwrap();
    fs::create_dir_all(repo.join("info")).unwrap();
    fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    fs::write(repo.join("objects").join(LOOSE_DIR).join(LOOSE_FILE), b"\x78\x01loose").unwrap();
    fs::write(
        repo.join(format!("objects/pack/pack-{PACK_ID}.pack")),
        b"PACK\x00\x00\x00\x02\x00\x00\x00\x00",
    )
    .unwrap();
    fs::write(
        repo.join("info/refs"),
        format!("{PACK_ID}\trefs/heads/main\n"),
    )
    .unwrap();
    root
}

/// A config that never finds a git binary, so only file-serving paths succeed.
fn offline_config(root: &Path) -> GatewayConfig {
    GatewayConfig {
        git_bin_path: root.join("missing-git"),
        ..GatewayConfig::new(root)
    }
}

async fn handle(gw: &GitGateway, mut input: MemoryInput) -> MemoryOutput {
    let mut output = MemoryOutput::new();
    gw.handle(&mut input, &mut output).await;
    output
}

#[tokio::test]
async fn loose_object_is_cached_forever() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));
    let path = format!("/r.git/objects/{LOOSE_DIR}/{LOOSE_FILE}");

    let out = handle(&gw, MemoryInput::get(&path)).await;
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(out.header(&header::CONTENT_TYPE), Some("application/x-git-loose-object"));
    assert_eq!(out.header(&header::CACHE_CONTROL), Some("public, max-age=31536000"));
    assert_eq!(out.body(), b"\x78\x01loose");
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));
    let path = format!("/r.git/objects/{LOOSE_DIR}/{}", "0".repeat(38));

    let out = handle(&gw, MemoryInput::get(&path)).await;
    assert_eq!(out.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(out.body_str(), "Not Found");
    assert!(out.header(&header::CACHE_CONTROL).is_none());
    assert!(out.header(&header::EXPIRES).is_none());
}

#[tokio::test]
async fn missing_repository_is_not_found() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));
    let out = handle(&gw, MemoryInput::get("/other.git/HEAD")).await;
    assert_eq!(out.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(out.body_str(), "Not Found");
}

/// Pushing is refused with 403 when receive-pack is disabled, even with the right content type.
#[tokio::test]
async fn receive_pack_disabled_is_forbidden() {
    let root = fixture();
    let gw = GitGateway::new(GatewayConfig {
        receive_pack: false,
        ..offline_config(root.path())
    });
    let input = MemoryInput::post("/r.git/git-receive-pack")
        .with_header("Content-Type", "application/x-git-receive-pack-request")
        .with_body(b"0000".to_vec());

    let out = handle(&gw, input).await;
    assert_eq!(out.status(), Some(StatusCode::FORBIDDEN));
    assert_eq!(out.body_str(), "Forbidden");
}

#[tokio::test]
async fn wrong_method() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));

    let out = handle(&gw, MemoryInput::post("/r.git/HEAD")).await;
    assert_eq!(out.status(), Some(StatusCode::METHOD_NOT_ALLOWED));

    let out = handle(
        &gw,
        MemoryInput::get("/r.git/git-upload-pack").with_version(Version::HTTP_10),
    )
    .await;
    assert_eq!(out.status(), Some(StatusCode::BAD_REQUEST));
}

#[tokio::test]
async fn text_files_are_not_cached() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));
    let out = handle(&gw, MemoryInput::get("/r.git/HEAD")).await;
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(out.header(&header::CONTENT_TYPE), Some("text/plain"));
    assert_eq!(out.header(&header::PRAGMA), Some("no-cache"));
    assert_eq!(out.body_str(), "ref: refs/heads/main\n");
}

/// Pack files honour byte ranges, so interrupted dumb fetches can resume.
#[tokio::test]
async fn pack_file_range() {
    let root = fixture();
    let gw = GitGateway::new(offline_config(root.path()));
    let input = MemoryInput::get(&format!("/r.git/objects/pack/pack-{PACK_ID}.pack"))
        .with_header("Range", "bytes=0-3");

    let out = handle(&gw, input).await;
    assert_eq!(out.status(), Some(StatusCode::PARTIAL_CONTENT));
    assert_eq!(out.header(&header::CONTENT_TYPE), Some("application/x-git-packed-objects"));
    assert_eq!(out.header(&header::CONTENT_RANGE), Some("bytes 0-3/12"));
    assert_eq!(out.body(), b"PACK");
}

/// Without access to the requested service, info/refs falls back to the dumb file.
#[tokio::test]
async fn info_refs_dumb_fallback() {
    let root = fixture();
    let gw = GitGateway::new(GatewayConfig {
        receive_pack: false,
        ..offline_config(root.path())
    });
    let out = handle(&gw, MemoryInput::get("/r.git/info/refs?service=git-receive-pack")).await;
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(out.header(&header::CONTENT_TYPE), Some("text/plain; charset=utf-8"));
    assert_eq!(out.header(&header::CACHE_CONTROL), Some("no-cache, max-age=0, must-revalidate"));
    assert_eq!(out.body_str(), format!("{PACK_ID}\trefs/heads/main\n"));
}

/// The gateway only routes git clients; other agents fall through to the next module.
#[tokio::test]
async fn mux_dispatch_by_user_agent() {
    let root = fixture();
    let mut mux = Mux::new();
    mux.register(GitGateway::new(offline_config(root.path())));

    let path = "/r.git/HEAD";
    assert!(!mux.route(&MemoryInput::get(path).with_header("User-Agent", "Mozilla/5.0")));

    let mut input = MemoryInput::get(path).with_header("User-Agent", "git/2.45.1");
    let mut output = MemoryOutput::new();
    mux.handle(&mut input, &mut output).await;
    assert_eq!(output.status(), Some(StatusCode::OK));
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn init_bare(root: &Path) -> bool {
    Command::new("git")
        .args(["init", "--quiet", "--bare", "r.git"])
        .current_dir(root)
        .status()
        .is_ok_and(|s| s.success())
}

fn pkt(line: &str) -> String {
    format!("{:04x}{line}", line.len() + 4)
}

#[tokio::test]
async fn smart_advertisement() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    assert!(init_bare(root.path()));
    let gw = GitGateway::new(GatewayConfig {
        git_bin_path: "git".into(),
        ..GatewayConfig::new(root.path())
    });

    let out = handle(&gw, MemoryInput::get("/r.git/info/refs?service=git-upload-pack")).await;
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(
        out.header(&header::CONTENT_TYPE),
        Some("application/x-git-upload-pack-advertisement")
    );
    assert!(out.body_str().starts_with("001e# service=git-upload-pack\n0000"));
}

/// A fetch of an unknown object still reaches the sink, stamped with the tool's failure.
#[tokio::test]
async fn upload_pack_reports_fetch_events() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    assert!(init_bare(root.path()));
    let events = Arc::new(Mutex::new(Vec::<Event>::new()));
    let seen = events.clone();
    let gw = GitGateway::new(GatewayConfig {
        git_bin_path: "git".into(),
        ..GatewayConfig::new(root.path())
    })
    .with_event_sink(move |e: Event| seen.lock().unwrap().push(e));

    let body = format!("{}0000{}", pkt(&format!("want {PACK_ID}\n")), pkt("done\n"));
    let input = MemoryInput::post("/r.git/git-upload-pack")
        .with_header("Content-Type", "application/x-git-upload-pack-request")
        .with_header("User-Agent", "git/2.45.1")
        .with_body(body);
    let out = handle(&gw, input).await;
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(
        out.header(&header::CONTENT_TYPE),
        Some("application/x-git-upload-pack-result")
    );

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.kind, EventKind::Fetch);
    assert_eq!(event.service, ServiceType::UploadPack);
    assert_eq!(event.commit, PACK_ID);
    assert_eq!(event.dir, root.path().join("r.git"));
    assert_eq!(event.request.user_agent.as_deref(), Some("git/2.45.1"));
    assert!(event.error.is_some());
}

/// Request and response bodies larger than the pipe buffers stream through the tool at the same
/// time: an echoing tool returns every byte instead of deadlocking.
#[cfg(unix)]
#[tokio::test]
async fn rpc_streams_large_bodies_both_ways() {
    let root = tempfile::tempdir().unwrap();
    let repo = root.path().join("r.git");
    fs::create_dir(&repo).unwrap();
    // `/bin/sh upload-pack ...` runs this script from the repository directory
    fs::write(repo.join("upload-pack"), "exec cat").unwrap();
    let gw = GitGateway::new(GatewayConfig {
        git_bin_path: "/bin/sh".into(),
        ..GatewayConfig::new(root.path())
    });

    let mut body = b"0000".to_vec();
    body.resize(4 * 1024 * 1024 + 4, b'x');
    let input = MemoryInput::post("/r.git/git-upload-pack")
        .with_header("Content-Type", "application/x-git-upload-pack-request")
        .with_body(body.clone());

    let out = tokio::time::timeout(Duration::from_secs(30), handle(&gw, input))
        .await
        .expect("rpc bridge stalled");
    assert_eq!(out.status(), Some(StatusCode::OK));
    assert_eq!(out.header(&header::CONTENT_TYPE), Some("application/x-git-upload-pack-result"));
    assert_eq!(out.body().len(), body.len());
    assert!(out.body() == &body[..]);
    assert!(out.aborted().is_none());
}
