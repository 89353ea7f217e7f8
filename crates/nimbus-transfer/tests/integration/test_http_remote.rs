//! Integration tests for the HTTP remote adapter
//!
//! Verifies request shapes and error mapping against a wiremock server.

use std::{sync::Arc, time::Duration};

use futures_util::TryStreamExt;
use nimbus_core::{
    classify::{classify_kind, ErrorKind, MalformedResponse},
    domain::{EntryKind, RemoteId},
    ports::{ChunkOutcome, RemoteStorage, StaticToken, UploadSession},
};
use nimbus_transfer::HttpRemoteStorage;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common;

const HASH: &str = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_list_root_parses_items() {
    let (server, remote) = common::setup_drive_mock().await;
    common::mount_children(
        &server,
        "root",
        serde_json::json!([
            common::file_json("f-1", "hello.txt", 5, Some(HASH)),
            common::folder_json("d-1", "Documents", "root"),
        ]),
    )
    .await;

    let items = remote.list(None).await.expect("list failed");
    assert_eq!(items.len(), 2);

    let file = &items[0];
    assert_eq!(file.id.as_str(), "f-1");
    assert_eq!(file.kind, EntryKind::File);
    assert_eq!(file.size, 5);
    assert!(file.parent_id.is_none(), "root parent maps to None");
    assert_eq!(
        file.content_hash.as_ref().map(|h| h.as_str().to_string()),
        Some(HASH.to_lowercase())
    );

    let folder = &items[1];
    assert_eq!(folder.kind, EntryKind::Directory);
    assert_eq!(folder.size, 0);
}

#[tokio::test]
async fn test_list_sends_bearer_token() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("GET"))
        .and(path("/items/d-1/children"))
        .and(header("Authorization", "Bearer test-access-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "value": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let folder = RemoteId::new("d-1").unwrap();
    let items = remote.list(Some(&folder)).await.expect("list failed");
    assert!(items.is_empty());
}

// ============================================================================
// Error mapping
// ============================================================================

#[tokio::test]
async fn test_html_error_page_is_malformed_response() {
    let (server, remote) = common::setup_drive_mock().await;
    let page = format!("<html><body>{}</body></html>", "x".repeat(2_000));
    Mock::given(method("GET"))
        .and(path("/items/root/children"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(page, "text/html")
                .append_header("X-Request-Id", "req-42"),
        )
        .mount(&server)
        .await;

    let err = remote.list(None).await.unwrap_err();
    assert_eq!(classify_kind(&err), ErrorKind::MalformedResponse);

    let malformed = err.downcast_ref::<MalformedResponse>().expect("diagnostics");
    let diagnostics = &malformed.0;
    assert_eq!(diagnostics.status, 200);
    assert_eq!(diagnostics.status_text, "OK");
    assert_eq!(diagnostics.content_type.as_deref(), Some("text/html"));
    assert!(diagnostics.headers.contains("x-request-id: req-42"));
    assert!(diagnostics.body.starts_with("<html>"));
    // 500 characters plus the truncation marker
    assert_eq!(diagnostics.body.chars().count(), 501);
}

#[tokio::test]
async fn test_json_of_wrong_shape_is_malformed_response() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("GET"))
        .and(path("/items/root/children"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": "nope" })),
        )
        .mount(&server)
        .await;

    let err = remote.list(None).await.unwrap_err();
    assert_eq!(classify_kind(&err), ErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_unauthorized_and_forbidden_map_to_access_denied() {
    for status in [401u16, 403] {
        let (server, remote) = common::setup_drive_mock().await;
        Mock::given(method("GET"))
            .and(path("/items/root/children"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                "error": { "code": "accessDenied", "message": "nope" }
            })))
            .mount(&server)
            .await;

        let err = remote.list(None).await.unwrap_err();
        assert_eq!(classify_kind(&err), ErrorKind::AccessDenied, "HTTP {status}");
    }
}

#[tokio::test]
async fn test_server_error_is_unknown() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("GET"))
        .and(path("/items/root/children"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = remote.list(None).await.unwrap_err();
    assert_eq!(classify_kind(&err), ErrorKind::Unknown);
}

#[tokio::test]
async fn test_connection_refused_is_network() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let remote = HttpRemoteStorage::new(
        uri,
        Arc::new(StaticToken("t".to_string())),
        Duration::from_secs(5),
    )
    .unwrap();
    let err = remote.list(None).await.unwrap_err();
    assert_eq!(classify_kind(&err), ErrorKind::Network);
}

#[tokio::test]
async fn test_stalled_server_times_out_as_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/root/children"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "value": [] }))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let remote = HttpRemoteStorage::new(
        server.uri(),
        Arc::new(StaticToken("t".to_string())),
        Duration::from_millis(200),
    )
    .unwrap();
    let err = remote.list(None).await.unwrap_err();
    assert_eq!(classify_kind(&err), ErrorKind::Network);
}

// ============================================================================
// Content
// ============================================================================

#[tokio::test]
async fn test_download_streams_content() {
    let (server, remote) = common::setup_drive_mock().await;
    let content: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    common::mount_download(&server, "f-1", &content).await;

    let stream = remote
        .download(&RemoteId::new("f-1").unwrap())
        .await
        .expect("download failed");
    let chunks: Vec<Vec<u8>> = stream.try_collect().await.expect("stream failed");
    assert_eq!(chunks.concat(), content);
}

#[tokio::test]
async fn test_delete_of_missing_item_succeeds() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("DELETE"))
        .and(path("/items/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    remote
        .delete(&RemoteId::new("gone").unwrap())
        .await
        .expect("delete of missing item should succeed");
}

#[tokio::test]
async fn test_upload_session_and_chunks() {
    let (server, remote) = common::setup_drive_mock().await;
    let upload_url = format!("{}/upload/s-1", server.uri());

    Mock::given(method("POST"))
        .and(path("/items/d-1:/hello.txt:/createUploadSession"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "uploadUrl": upload_url })),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/s-1"))
        .and(header("Content-Range", "bytes 0-2/5"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["3-"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/s-1"))
        .and(header("Content-Range", "bytes 3-4/5"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(common::file_json("f-9", "hello.txt", 5, Some(HASH))),
        )
        .mount(&server)
        .await;

    let parent = RemoteId::new("d-1").unwrap();
    let session = remote
        .begin_upload(Some(&parent), "hello.txt", 5)
        .await
        .expect("session");
    assert_eq!(
        session,
        UploadSession {
            locator: upload_url.clone(),
            total_size: 5
        }
    );

    let first = remote.upload_chunk(&session, 0, b"hel".to_vec()).await.unwrap();
    assert_eq!(first, ChunkOutcome::Pending);

    let last = remote.upload_chunk(&session, 3, b"lo".to_vec()).await.unwrap();
    match last {
        ChunkOutcome::Complete(item) => assert_eq!(item.id.as_str(), "f-9"),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_move_item_sends_new_parent_and_name() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("PATCH"))
        .and(path("/items/f-1"))
        .and(body_partial_json(serde_json::json!({
            "name": "renamed.txt",
            "parentReference": { "id": "d-2" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "f-1",
            "name": "renamed.txt",
            "size": 5,
            "parentReference": { "id": "d-2" },
            "file": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let item = remote
        .move_item(
            &RemoteId::new("f-1").unwrap(),
            Some(&RemoteId::new("d-2").unwrap()),
            "renamed.txt",
        )
        .await
        .expect("move failed");
    assert_eq!(item.name, "renamed.txt");
    assert_eq!(item.parent_id.as_ref().map(RemoteId::as_str), Some("d-2"));
}

#[tokio::test]
async fn test_create_folder_conflict_returns_existing() {
    let (server, remote) = common::setup_drive_mock().await;
    Mock::given(method("POST"))
        .and(path("/items/root/children"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "error": { "code": "nameAlreadyExists" }
        })))
        .mount(&server)
        .await;
    common::mount_children(
        &server,
        "root",
        serde_json::json!([common::folder_json("d-7", "Photos", "root")]),
    )
    .await;

    let folder = remote.create_folder(None, "Photos").await.expect("create");
    assert_eq!(folder.id.as_str(), "d-7");
    assert!(folder.is_directory());
}
