use std::time::Duration;

use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::accounts::AccountStore;

fn config(dir: &TempDir, server: Option<&MockServer>) -> DaemonConfig {
    DaemonConfig {
        data_dir: dir.path().join("data"),
        storage_root: dir.path().join("files"),
        server_url: server.map(MockServer::uri),
        user: server.map(|_| "alice".to_string()),
        password: server.map(|_| "secret".to_string()),
        remember_password: false,
        success_retention: 30,
        idle_grace: Duration::from_millis(50),
        retry_base: Duration::from_secs(30),
        retry_max: Duration::from_secs(900),
        unmetered: true,
        charging: true,
        power_saving: false,
    }
}

#[tokio::test]
async fn upload_command_creates_parents_and_records_success() {
    let server = MockServer::start().await;
    Mock::given(method("MKCOL"))
        .and(path("/remote.php/dav/files/alice/Docs/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/remote.php/dav/files/alice/Docs/a.txt"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"e1\""))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("a.txt");
    std::fs::write(&source, b"payload").unwrap();
    let runtime = DaemonRuntime::bootstrap(config(&dir, Some(&server)))
        .await
        .unwrap();

    let outcome = runtime
        .upload(UploadCommand {
            local_path: source.clone(),
            remote_path: "/Docs/a.txt".into(),
            policy: NameCollisionPolicy::Rename,
            behaviour: LocalBehaviour::Forget,
        })
        .await
        .unwrap();

    assert_eq!(outcome.code, ResultCode::Ok);
    assert_eq!(outcome.final_path.as_deref(), Some("/Docs/a.txt"));
    assert!(source.exists());
    let lines = runtime.upload_lines().await.unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"remote_path\":\"/Docs/a.txt\""));
}

#[tokio::test]
async fn download_command_stores_file_under_account_folder() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/Docs/b.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"e2\"")
                .set_body_bytes(b"hello".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config(&dir, Some(&server)))
        .await
        .unwrap();
    let outcome = runtime.download("/Docs/b.txt".into()).await.unwrap();
    assert_eq!(outcome.code, ResultCode::Ok);

    let account = runtime.account_name().unwrap().to_string();
    let stored = dir.path().join("files").join(account).join("Docs/b.txt");
    assert_eq!(std::fs::read(stored).unwrap(), b"hello");
}

#[tokio::test]
async fn rejected_credentials_surface_as_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config(&dir, Some(&server)))
        .await
        .unwrap();
    let outcome = runtime.download("/secret.txt".into()).await.unwrap();
    assert_eq!(outcome.code, ResultCode::Unauthorized);
}

#[tokio::test]
async fn transfers_need_a_configured_account() {
    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config(&dir, None)).await.unwrap();
    assert!(runtime.download("/a.txt".into()).await.is_err());
    assert_eq!(runtime.retry().await.unwrap(), 0);
    assert!(runtime.logout().await.is_err());
}

#[tokio::test]
async fn removing_an_account_stops_its_transfers_and_drops_records() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config(&dir, Some(&server)))
        .await
        .unwrap();
    let account = runtime.account_name().unwrap().to_string();
    let mut events = runtime.uploader.events();
    for name in ["slow.txt", "queued.txt"] {
        let source = dir.path().join(name);
        std::fs::write(&source, b"payload").unwrap();
        let request = UploadRequest::new(account.as_str(), source, format!("/{name}"));
        assert!(runtime.uploader.request(request).await.unwrap().is_queued());
    }
    let slow = TransferKey::new(account.as_str(), "/slow.txt");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(TransferEvent::Started { remote_path, .. }) = events.recv().await
                && remote_path == slow.remote_path
            {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(runtime.remove_account(&account).await, 1);

    let code = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(TransferEvent::Finished {
                remote_path, code, ..
            }) = events.recv().await
                && remote_path == slow.remote_path
            {
                return code;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(code, ResultCode::Cancelled);
    assert!(runtime.upload_lines().await.unwrap().is_empty());
    assert!(!runtime.accounts.exists(&account));
    assert_eq!(runtime.uploader.pending_len(), 0);
}
