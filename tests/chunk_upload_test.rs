mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use common::*;
use sheet_ingest::models::{ChunkOutcome, ChunkSubmission, JobState};
use sheet_ingest::services::chunk_assembly::{ChunkAssemblyManager, ChunkError, ChunkLimits};
use sheet_ingest::services::kv_store::MemoryKvStore;
use sheet_ingest::utils::hash::calculate_hash;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const MIB: usize = 1024 * 1024;

fn manager() -> ChunkAssemblyManager {
    ChunkAssemblyManager::new(
        Arc::new(MemoryKvStore::new()),
        ChunkLimits {
            max_file_size: 50 * MIB as u64,
            max_chunk_size: 10 * MIB as u64,
            session_ttl: Duration::from_secs(3600),
        },
    )
}

fn submission(file: &Bytes, file_id: &str, index: usize, chunk_size: usize, total: usize) -> ChunkSubmission {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file.len());
    ChunkSubmission {
        owner_id: "alice".to_string(),
        file_id: file_id.to_string(),
        file_name: "large.xlsx".to_string(),
        mime_type: XLSX_MIME.to_string(),
        declared_size: file.len() as u64,
        chunk_index: index as u32,
        total_chunks: total as u32,
        payload: file.slice(start..end),
    }
}

#[tokio::test]
async fn test_out_of_order_25mib_upload_reassembles() {
    let m = manager();
    let file: Bytes = (0..25 * MIB).map(|i| (i % 253) as u8).collect::<Vec<u8>>().into();
    let original_hash = calculate_hash(&file);

    let order = [2usize, 0, 4, 1, 3];
    for (n, index) in order.iter().enumerate() {
        let outcome = m
            .submit_chunk(submission(&file, "big-1", *index, 5 * MIB, 5))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Pending { received, total, .. } => {
                assert!(n < 4, "assembled too early");
                assert_eq!(received as usize, n + 1);
                assert_eq!(total, 5);
            }
            ChunkOutcome::Assembled { buffer, session } => {
                assert_eq!(n, 4, "assembled only after the fifth chunk");
                assert_eq!(session.total_chunks, 5);
                assert_eq!(buffer.len(), file.len());
                assert_eq!(calculate_hash(&buffer), original_hash);
            }
        }
    }
    assert!(m.session("alice", "big-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_every_permutation_of_four_chunks() {
    let file = Bytes::from_static(b"abcdefghijklmnop");
    let m = manager();

    let mut permutations = Vec::new();
    let items = [0usize, 1, 2, 3];
    for a in items {
        for b in items {
            for c in items {
                for d in items {
                    let p = [a, b, c, d];
                    let mut sorted = p;
                    sorted.sort();
                    if sorted == items {
                        permutations.push(p);
                    }
                }
            }
        }
    }
    assert_eq!(permutations.len(), 24);

    for (n, perm) in permutations.iter().enumerate() {
        let file_id = format!("perm-{}", n);
        let mut assembled = None;
        for index in perm {
            if let ChunkOutcome::Assembled { buffer, .. } = m
                .submit_chunk(submission(&file, &file_id, *index, 4, 4))
                .await
                .unwrap()
            {
                assembled = Some(buffer);
            }
        }
        assert_eq!(assembled.as_deref(), Some(&file[..]), "{:?}", perm);
    }
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected() {
    let m = manager();
    let file = Bytes::from(vec![0u8; 11 * MIB]);
    let err = m
        .submit_chunk(submission(&file, "too-big", 0, 11 * MIB, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkError::PayloadTooLarge(_)));
}

#[tokio::test]
async fn test_sessions_are_scoped_per_owner() {
    let m = manager();
    let file = Bytes::from_static(b"0123456789");

    m.submit_chunk(submission(&file, "shared-id", 0, 5, 2))
        .await
        .unwrap();

    let mut other = submission(&file, "shared-id", 1, 5, 2);
    other.owner_id = "bob".to_string();
    let outcome = m.submit_chunk(other).await.unwrap();
    assert!(matches!(outcome, ChunkOutcome::Pending { received: 1, .. }));
}

fn chunk_request(token: &str, upload_id: &str, index: usize, total: usize, size: usize, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload/chunk")
        .header("Authorization", format!("Bearer {}", token))
        .header("x-file-id", upload_id)
        .header("x-file-name", "chunked.xlsx")
        .header("x-file-size", size.to_string())
        .header("x-chunk-index", index.to_string())
        .header("x-total-chunks", total.to_string())
        .header("x-file-type", XLSX_MIME)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_chunked_upload_over_http() {
    let app = TestApp::spawn().await;
    let token = token_for("alice");
    let workbook = sample_workbook();
    let chunk_size = workbook.len().div_ceil(3);
    let pieces: Vec<Vec<u8>> = workbook.chunks(chunk_size).map(|c| c.to_vec()).collect();
    assert_eq!(pieces.len(), 3);

    let mut final_json = None;
    for (n, index) in [1usize, 2, 0].iter().enumerate() {
        let response = app
            .app
            .clone()
            .oneshot(chunk_request(
                &token,
                "client-upload-1",
                *index,
                3,
                workbook.len(),
                pieces[*index].clone(),
            ))
            .await
            .unwrap();
        if n < 2 {
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let json = body_json(response).await;
            assert_eq!(json["chunks_received"], n as u64 + 1);
            assert_eq!(json["total_chunks"], 3);
        } else {
            assert_eq!(response.status(), StatusCode::CREATED);
            final_json = Some(body_json(response).await);
        }
    }

    let json = final_json.unwrap();
    let job_id = json["job_id"].as_str().unwrap().parse().unwrap();
    let job = wait_for_job(app.queue(), job_id, "alice").await;
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_chunk_headers_are_required() {
    let app = TestApp::spawn().await;
    let request = Request::builder()
        .method("POST")
        .uri("/upload/chunk")
        .header("Authorization", format!("Bearer {}", token_for("alice")))
        .header("x-file-id", "u1")
        .header("x-file-name", "a.xlsx")
        .body(Body::from("abc"))
        .unwrap();
    let response = app.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("x-file-size"));
}
