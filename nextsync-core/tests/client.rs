use std::sync::Mutex;

use nextsync_core::{
    CancellationToken, DavClient, DavError, ErrorClass, NameCollisionPolicy, NoProgress,
    ProgressUpdate, UploadSpec,
};
use tempfile::tempdir;
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH: &str = "Basic YWxpY2U6c2VjcmV0";

fn client(server: &MockServer) -> DavClient {
    DavClient::new(&server.uri(), "alice", "secret").unwrap()
}

#[tokio::test]
async fn upload_puts_file_under_user_root() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/remote.php/dav/files/alice/Docs/a.txt"))
        .and(header("authorization", AUTH))
        .and(body_bytes(b"payload"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("ETag", "\"abc123\"")
                .insert_header("OC-FileId", "00000042oc"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("a.txt");
    std::fs::write(&source, b"payload").unwrap();

    let seen = Mutex::new(Vec::<ProgressUpdate>::new());
    let listener = |update: &ProgressUpdate| seen.lock().unwrap().push(update.clone());
    let remote = client(&server)
        .upload_file(
            UploadSpec {
                local_path: &source,
                remote_path: "/Docs/a.txt",
                policy: NameCollisionPolicy::Overwrite,
                create_parents: false,
            },
            &listener,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(remote.remote_path, "/Docs/a.txt");
    assert_eq!(remote.etag.as_deref(), Some("abc123"));
    assert_eq!(remote.remote_id.as_deref(), Some("00000042oc"));
    assert_eq!(remote.size, Some(7));
    let seen = seen.lock().unwrap();
    let last = seen.last().expect("at least one progress report");
    assert_eq!(last.transferred, 7);
    assert_eq!(last.percent(), Some(100));
    assert_eq!(last.name, "a.txt");
}

#[tokio::test]
async fn rename_policy_picks_next_free_name() {
    let server = MockServer::start().await;
    for taken in ["/remote.php/dav/files/alice/Docs/a.txt", "/remote.php/dav/files/alice/Docs/a%20(2).txt"] {
        Mock::given(method("HEAD"))
            .and(path(taken))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path("/remote.php/dav/files/alice/Docs/a%20(3).txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("a.txt");
    std::fs::write(&source, b"payload").unwrap();

    let remote = client(&server)
        .upload_file(
            UploadSpec {
                local_path: &source,
                remote_path: "/Docs/a.txt",
                policy: NameCollisionPolicy::Rename,
                create_parents: false,
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(remote.remote_path, "/Docs/a (3).txt");
}

#[tokio::test]
async fn skip_policy_reports_existing_remote() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/remote.php/dav/files/alice/Docs/a.txt"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("a.txt");
    std::fs::write(&source, b"payload").unwrap();

    let err = client(&server)
        .upload_file(
            UploadSpec {
                local_path: &source,
                remote_path: "/Docs/a.txt",
                policy: NameCollisionPolicy::Skip,
                create_parents: false,
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .expect_err("existing remote must not be overwritten");

    assert!(matches!(err, DavError::Exists(_)));
    assert_eq!(err.classification(), ErrorClass::Conflict);
}

#[tokio::test]
async fn creates_missing_parent_folders() {
    let server = MockServer::start().await;
    Mock::given(method("MKCOL"))
        .and(path("/remote.php/dav/files/alice/Photos/"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .and(path("/remote.php/dav/files/alice/Photos/2024/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/remote.php/dav/files/alice/Photos/2024/img.jpg"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("img.jpg");
    std::fs::write(&source, b"jpeg").unwrap();

    client(&server)
        .upload_file(
            UploadSpec {
                local_path: &source,
                remote_path: "/Photos/2024/img.jpg",
                policy: NameCollisionPolicy::Overwrite,
                create_parents: true,
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_local_file_is_classified() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    let err = client(&server)
        .upload_file(
            UploadSpec {
                local_path: &dir.path().join("gone.txt"),
                remote_path: "/gone.txt",
                policy: NameCollisionPolicy::Overwrite,
                create_parents: false,
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .expect_err("local file is missing");

    assert_eq!(err.classification(), ErrorClass::LocalFileMissing);
}

#[tokio::test]
async fn download_writes_target_and_reports_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/Docs/hello.txt"))
        .and(header("authorization", AUTH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"hello")
                .insert_header("ETag", "\"e1\"")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                .insert_header("OC-FileId", "77")
                .insert_header("OC-Checksum", "MD5:5d41402abc4b2a76b9719d911017c592"),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("nested/hello.txt");
    let seen = Mutex::new(Vec::<u64>::new());
    let listener = |update: &ProgressUpdate| seen.lock().unwrap().push(update.transferred);

    let remote = client(&server)
        .download_file("/Docs/hello.txt", &target, &listener, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"hello");
    assert!(!dir.path().join("nested/hello.txt.partial").exists());
    assert_eq!(remote.etag.as_deref(), Some("e1"));
    assert_eq!(remote.modified, Some(1_445_412_480));
    assert_eq!(remote.remote_id.as_deref(), Some("77"));
    assert_eq!(remote.size, Some(5));
    assert_eq!(seen.lock().unwrap().last().copied(), Some(5));
}

#[tokio::test]
async fn download_rejects_checksum_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/bad.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"hello")
                .insert_header("OC-Checksum", "MD5:deadbeef"),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("bad.txt");

    let err = client(&server)
        .download_file("/bad.txt", &target, &NoProgress, &CancellationToken::new())
        .await
        .expect_err("expected md5 mismatch");

    assert!(matches!(err, DavError::IntegrityMismatch { .. }));
    assert_eq!(err.classification(), ErrorClass::Integrity);
    assert!(!target.exists());
}

#[tokio::test]
async fn unauthorized_download_is_classified_as_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let err = client(&server)
        .download_file(
            "/secret.txt",
            &dir.path().join("secret.txt"),
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .expect_err("expected auth failure");

    assert_eq!(err.classification(), ErrorClass::Auth);
}

#[tokio::test]
async fn cancelled_token_skips_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let err = client(&server)
        .download_file("/a.txt", &dir.path().join("a.txt"), &NoProgress, &token)
        .await
        .expect_err("cancelled before start");

    assert!(matches!(err, DavError::Cancelled));
}

#[tokio::test]
async fn failed_download_leaves_no_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/Docs"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    // A non-empty folder sits where the file should land, so the final rename fails.
    let target = dir.path().join("Docs");
    std::fs::create_dir_all(target.join("inside")).unwrap();

    let err = client(&server)
        .download_file("/Docs", &target, &NoProgress, &CancellationToken::new())
        .await
        .expect_err("rename onto a folder must fail");

    assert!(matches!(err, DavError::Io(_)));
    assert!(!dir.path().join("Docs.partial").exists());
    assert!(target.join("inside").is_dir());
}

#[tokio::test]
async fn download_cancelled_mid_stream_removes_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/big.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64 * 1024]))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("big.bin");
    let token = CancellationToken::new();
    let listener = |_: &ProgressUpdate| token.cancel();

    let err = client(&server)
        .download_file("/big.bin", &target, &listener, &token)
        .await
        .expect_err("cancelled after the first chunk");

    assert!(matches!(err, DavError::Cancelled));
    assert!(!target.exists());
    assert!(!dir.path().join("big.bin.partial").exists());
}
