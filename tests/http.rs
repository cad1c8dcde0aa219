use mirrorfs_server::handlers::ServeContext;
use mirrorfs_server::provider::{RefreshReason, SnapshotProvider};
use mirrorfs_server::routes::routes;
use mirrorfs_server::settings::{Settings, SettingsHandle};

use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;

struct Fixture {
    _tmp: TempDir,
    games: PathBuf,
    content: Vec<u8>,
    ctx: ServeContext,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let games = tmp.path().join("games");
    std::fs::create_dir_all(games.join("dlc")).unwrap();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(games.join("Big Game.nsp"), &content).unwrap();
    std::fs::write(games.join("dlc/extra.xci"), b"dlc").unwrap();
    std::fs::write(games.join("readme.txt"), b"skipped").unwrap();

    let settings = SettingsHandle::new(Settings {
        served_directories: vec![games.clone()],
        transfer_buffer_size: 64,
        ..Settings::default()
    });
    let provider = SnapshotProvider::initialize(settings.clone()).await.unwrap();
    Fixture {
        _tmp: tmp,
        games,
        content,
        ctx: ServeContext {
            provider,
            settings,
            shutdown: CancellationToken::new(),
        },
    }
}

#[tokio::test]
async fn whole_file_without_range() {
    let fx = fixture().await;
    let res = warp::test::request()
        .path("/games/Big%20Game.nsp")
        .reply(&routes(fx.ctx.clone()))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-length"], "1000");
    assert_eq!(res.headers()["accept-ranges"], "bytes");
    assert_eq!(res.headers()["content-type"], "application/octet-stream");
    assert!(res.headers().get("content-range").is_none());
    assert_eq!(res.body().as_ref(), fx.content.as_slice());
}

#[tokio::test]
async fn ranges_are_served_as_partial_content() {
    let fx = fixture().await;
    let filter = routes(fx.ctx.clone());

    let cases = [
        ("bytes=0-499", 0usize, 500usize, "bytes 0-499/1000"),
        ("bytes=500-", 500, 500, "bytes 500-999/1000"),
        ("bytes=-100", 900, 100, "bytes 900-999/1000"),
        ("bytes=990-5000", 990, 10, "bytes 990-999/1000"),
    ];
    for (header, start, length, content_range) in cases {
        let res = warp::test::request()
            .path("/games/Big%20Game.nsp")
            .header("range", header)
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT, "{}", header);
        assert_eq!(res.headers()["content-range"], content_range);
        assert_eq!(res.headers()["content-length"], length.to_string().as_str());
        assert_eq!(res.body().as_ref(), &fx.content[start..start + length]);
    }
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let fx = fixture().await;
    let filter = routes(fx.ctx.clone());
    for header in ["bytes=1000-", "bytes=600-500", "bytes=-0", "pages=1-2"] {
        let res = warp::test::request()
            .path("/games/Big%20Game.nsp")
            .header("range", header)
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{}", header);
        assert_eq!(res.headers()["content-range"], "bytes */1000");
    }
}

#[tokio::test]
async fn head_returns_headers_only() {
    let fx = fixture().await;
    let res = warp::test::request()
        .method("HEAD")
        .path("/games/Big%20Game.nsp")
        .header("range", "bytes=0-9")
        .reply(&routes(fx.ctx.clone()))
        .await;
    assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(res.headers()["content-length"], "10");
    assert!(res.body().is_empty());
}

#[tokio::test]
async fn directories_are_listed_as_json() {
    let fx = fixture().await;
    let filter = routes(fx.ctx.clone());

    let res = warp::test::request().path("/").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    let doc: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(doc["directories"], serde_json::json!(["/games/"]));
    let urls: Vec<&str> = doc["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["url"].as_str().unwrap())
        .collect();
    assert_eq!(urls, vec!["/games/Big%20Game.nsp", "/games/dlc/extra.xci"]);
    assert_eq!(
        doc["generation"].as_str().unwrap(),
        fx.ctx.provider.current().generation().to_string()
    );

    let res = warp::test::request().path("/games/dlc/").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::OK);
    let doc: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(doc["files"][0]["size"], 3);
}

#[tokio::test]
async fn unknown_paths_and_methods_are_404() {
    let fx = fixture().await;
    let filter = routes(fx.ctx.clone());

    let res = warp::test::request().path("/games/missing.nsp").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // filtered out by extension
    let res = warp::test::request().path("/games/readme.txt").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = warp::test::request()
        .method("POST")
        .path("/games/Big%20Game.nsp")
        .reply(&filter)
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn favicon_is_served() {
    let fx = fixture().await;
    let res = warp::test::request()
        .path("/favicon.ico")
        .reply(&routes(fx.ctx.clone()))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "image/x-icon");
    assert!(!res.body().is_empty());
}

#[tokio::test]
async fn refresh_is_visible_to_new_requests_only() {
    let fx = fixture().await;
    let filter = routes(fx.ctx.clone());

    std::fs::write(fx.games.join("new.nsz"), b"fresh").unwrap();
    let res = warp::test::request().path("/games/new.nsz").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    fx.ctx
        .provider
        .refresh(RefreshReason::FileSystemChanged)
        .await
        .unwrap();
    let res = warp::test::request().path("/games/new.nsz").reply(&filter).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.body().as_ref(), b"fresh");
}

#[tokio::test]
async fn file_deleted_after_snapshot_is_404() {
    let fx = fixture().await;
    std::fs::remove_file(fx.games.join("dlc/extra.xci")).unwrap();
    let res = warp::test::request()
        .path("/games/dlc/extra.xci")
        .reply(&routes(fx.ctx.clone()))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
