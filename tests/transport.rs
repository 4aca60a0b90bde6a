//! Transport behavior against a mock registry: auth scope escalation,
//! mirror fallback, and short-read resume.

mod common;

use std::io::Cursor;

use bytes::Bytes;
use regmirror::image::{Digest, Reference};
use regmirror::scheme::Blob;
use tokio_util::sync::CancellationToken;

use common::registry::{MockRegistry, RegistryState};
use common::{plain_host, seed_image, test_client};

#[tokio::test]
async fn auth_scope_escalation() {
    let mut state = RegistryState::default();
    state.require_auth = true;
    seed_image(&mut state, "a/img", "1");
    let mock = MockRegistry::spawn_with(state);

    let client = test_client(vec![plain_host(&mock.host())]);
    let cancel = CancellationToken::new();
    let r = Reference::parse(&format!("{}/a/img:1", mock.host())).unwrap();

    // read path: one 401, then a pull-scoped token
    let head = client.manifest_head(&r, &cancel).await.unwrap();
    {
        let st = mock.state.lock().unwrap();
        assert_eq!(st.tokens_issued, vec!["repository:a/img:pull"]);
    }

    // write path: scope accumulates to pull,push before the upload
    let manifest = client.manifest_get(&r, &cancel).await.unwrap();
    let data = Bytes::from_static(b"extra-blob");
    let d = Digest::from_bytes(&data);
    let blob = Blob::from_bytes(data, Some(&d)).unwrap();
    client.blob_put(&r, &d, blob, &cancel).await.unwrap();
    client
        .manifest_put(&r.with_tag("copy"), &manifest, &cancel)
        .await
        .unwrap();

    let st = mock.state.lock().unwrap();
    // two token fetches total: pull, then the accumulated pull,push;
    // later writes reuse the cached push token with no further 401s
    assert_eq!(st.tokens_issued.len(), 2, "exactly two token fetches");
    assert_eq!(st.tokens_issued[1], "repository:a/img:pull,push");
    assert_eq!(&head.descriptor.digest, manifest.digest());
    assert!(st
        .manifests
        .contains_key(&("a/img".to_string(), "copy".to_string())));
}

#[tokio::test]
async fn mirror_fallback_on_server_error() {
    // upstream host with two mirrors; the first mirror fails once
    let mut m1_state = RegistryState::default();
    m1_state.fail_once.push("/manifests/".to_string());
    let m1 = MockRegistry::spawn_with(m1_state);

    let mut m2_state = RegistryState::default();
    let digest = seed_image(&mut m2_state, "a/img", "1");
    let m2 = MockRegistry::spawn_with(m2_state);

    let mut upstream_state = RegistryState::default();
    seed_image(&mut upstream_state, "a/img", "1");
    let upstream = MockRegistry::spawn_with(upstream_state);

    let mut upstream_config = plain_host(&upstream.host());
    upstream_config.mirrors = vec![m1.host(), m2.host()];
    // equal priorities: mirrors keep their configured order, upstream last
    let client = test_client(vec![
        upstream_config,
        plain_host(&m1.host()),
        plain_host(&m2.host()),
    ]);
    let cancel = CancellationToken::new();
    let r = Reference::parse(&format!("{}/a/img:1", upstream.host())).unwrap();

    let manifest = client.manifest_get(&r, &cancel).await.unwrap();
    assert_eq!(manifest.digest(), &digest);

    // one failed attempt on the first mirror, one success on the second,
    // upstream untouched
    assert_eq!(
        mock_manifest_requests(&m1), 1,
        "first mirror tried exactly once"
    );
    assert_eq!(
        mock_manifest_requests(&m2), 1,
        "second mirror served the request"
    );
    assert_eq!(mock_manifest_requests(&upstream), 0, "upstream not needed");
}

fn mock_manifest_requests(mock: &MockRegistry) -> usize {
    mock.state
        .lock()
        .unwrap()
        .requests_matching("/manifests/")
        .len()
}

#[tokio::test]
async fn short_read_resumes_with_range_request() {
    // a blob stream that ends early; the declared length is authoritative
    let payload: Vec<u8> = (0u32..150_000).flat_map(|i| i.to_le_bytes()).collect();
    let digest = Digest::from_bytes(&payload);
    let cut = 360_000usize;
    let total = payload.len();

    let first_part = payload[..cut].to_vec();
    let rest = payload.clone();

    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let range = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("range"))
                .map(|h| h.value.to_string());
            match range {
                None => {
                    // full response header, truncated body
                    let resp = tiny_http::Response::new(
                        tiny_http::StatusCode(200),
                        vec![],
                        Cursor::new(first_part.clone()),
                        Some(total),
                        None,
                    );
                    let _ = request.respond(resp);
                }
                Some(spec) => {
                    let spec = spec.trim_start_matches("bytes=");
                    let (start, end) = spec.split_once('-').unwrap();
                    let start: usize = start.parse().unwrap();
                    let end: usize = end.parse().unwrap();
                    assert_eq!(start, cut, "resume starts where the stream died");
                    assert_eq!(end, total - 1);
                    let slice = rest[start..=end].to_vec();
                    let resp = tiny_http::Response::from_data(slice)
                        .with_status_code(206)
                        .with_header(
                            tiny_http::Header::from_bytes(
                                "Content-Range".as_bytes(),
                                format!("bytes {}-{}/{}", start, end, total).as_bytes(),
                            )
                            .unwrap(),
                        );
                    let _ = request.respond(resp);
                }
            }
        }
    });

    let host = format!("127.0.0.1:{}", port);
    let client = test_client(vec![plain_host(&host)]);
    let cancel = CancellationToken::new();
    let r = Reference::parse(&format!("{}/a/img:1", host)).unwrap();

    let blob = client.blob_get(&r, &digest, &cancel).await.unwrap();
    let read = blob.read_all().await.unwrap();
    assert_eq!(read.len(), total);
    // digest verification covered the stitched stream
    assert_eq!(Digest::from_bytes(&read), digest);
}
