mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use fusion_client::config::{LimitSettings, OperationLimits};
use fusion_client::{
    ApiClient, ClientError, DeleteOptions, Domain, ErrorKind, Identifier, IdentifierSequence,
    ListRequest, ResourceEndpoint, RetrieveOptions, Retrieved, UpdateMode, WriteOptions,
};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn assets() -> ResourceEndpoint {
    ResourceEndpoint::new(Domain::General, "/assets")
}

fn uniform_limits(size: usize) -> LimitSettings {
    LimitSettings {
        default: OperationLimits::uniform(size),
        ..LimitSettings::default()
    }
}

fn ids(items: &[Value]) -> Vec<i64> {
    items.iter().filter_map(|item| item["id"].as_i64()).collect()
}

#[tokio::test]
async fn retryable_status_is_attempted_exactly_max_attempts_times() {
    for max_attempts in [1, 3, 5] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(common::path("/assets/1")))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(max_attempts))
            .mount(&server)
            .await;

        let mut config = common::config(&server.uri());
        config.retry.max_attempts = max_attempts;
        let client = ApiClient::new(config).expect("client");

        let error = client.get_json("/assets/1").await.expect_err("always unavailable");
        assert_eq!(error.kind(), ErrorKind::Transient);
        assert_eq!(error.api_error().map(|api| api.status.as_u16()), Some(503));
    }
}

#[tokio::test]
async fn sends_identifying_headers_with_one_request_id_across_retries() {
    let server = MockServer::start().await;
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen);

    Mock::given(method("GET"))
        .and(path(common::path("/assets/1")))
        .and(header("authorization", "Bearer secret"))
        .and(header("accept", "application/json"))
        .and(header("x-fusion-app", "fusion-client"))
        .and(header_exists("x-fusion-sdk"))
        .and(header_exists("user-agent"))
        .respond_with(move |request: &Request| -> ResponseTemplate {
            let mut seen = recorder.lock();
            let id = request.headers.get("x-request-id");
            if let Some(id) = id.and_then(|value| value.to_str().ok()) {
                seen.push(id.to_owned());
            }
            if seen.len() < 2 {
                ResponseTemplate::new(429)
            } else {
                ResponseTemplate::new(200).set_body_json(json!({"id": 1}))
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let asset = client.get_json("/assets/1").await.expect("asset");

    assert_eq!(asset, json!({"id": 1}));
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
}

#[tokio::test]
async fn compresses_post_bodies_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/list")))
        .and(header("content-encoding", "gzip"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let config = common::config(&server.uri()).with_gzip_disabled(false);
    let client = ApiClient::new(config).expect("client");
    let items = client.list(&assets(), ListRequest::post()).await.expect("items");
    assert!(items.is_empty());
}

#[tokio::test]
async fn authorization_failures_are_distinct_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": 401, "message": "Unauthorized"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let error = client.get_json("/assets/1").await.expect_err("unauthorized");

    assert_eq!(error.kind(), ErrorKind::Authorization);
    assert!(matches!(&error, ClientError::Authorization { project, .. } if project == "demo"));
}

#[tokio::test]
async fn connection_failures_surface_as_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("address");
    drop(listener);

    let mut config = common::config(&format!("http://{address}"));
    config.retry.max_connect_retries = 1;
    let client = ApiClient::new(config).expect("client");

    let error = client.get_json("/assets").await.expect_err("connection refused");
    assert_eq!(error.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn read_timeouts_are_replayed_only_for_retryable_posts() {
    let server = MockServer::start().await;
    let slow = ResponseTemplate::new(200)
        .set_body_json(json!({"items": []}))
        .set_delay(Duration::from_millis(500));
    Mock::given(method("POST"))
        .and(path(common::path("/assets/byids")))
        .respond_with(slow.clone())
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets")))
        .respond_with(slow)
        .expect(1)
        .mount(&server)
        .await;

    let mut config = common::config(&server.uri());
    config.timeout = Duration::from_millis(100);
    config.retry.max_read_retries = 2;
    let client = ApiClient::new(config).expect("client");

    let retrieve = client
        .retrieve_multiple(
            &assets(),
            &IdentifierSequence::new(vec![Identifier::Id(1)]),
            RetrieveOptions::default(),
        )
        .await
        .expect_err("every attempt times out");
    assert_eq!(retrieve.batch_failure().map(|failure| failure.unknown.len()), Some(1));

    let create = client
        .create_multiple(&assets(), vec![json!({"externalId": "a"})], WriteOptions::default())
        .await
        .expect_err("times out once");
    let failure = create.batch_failure().expect("compound failure");
    assert_eq!(failure.unknown.len(), 1);
    assert_eq!(failure.unknown[0].item, json!({"externalId": "a"}));
}

#[tokio::test]
async fn batch_retrieve_reports_each_unresolved_identifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/byids")))
        .respond_with(|request: &Request| -> ResponseTemplate {
            let items = common::body_of(request)["items"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            if items.contains(&json!({"id": 3})) {
                common::missing(json!([{"id": 3}]))
            } else {
                let found: Vec<Value> = items
                    .iter()
                    .map(|item| json!({"id": item["id"], "name": "pump"}))
                    .collect();
                ResponseTemplate::new(200).set_body_json(json!({"items": found}))
            }
        })
        .expect(3)
        .mount(&server)
        .await;

    let config = common::config(&server.uri()).with_limits(uniform_limits(2));
    let client = ApiClient::new(config).expect("client");

    let error = client
        .retrieve_multiple(
            &assets(),
            &IdentifierSequence::load(&[1, 2, 3, 4, 5], &[]),
            RetrieveOptions::default(),
        )
        .await
        .expect_err("id 3 is unknown");

    assert_eq!(error.kind(), ErrorKind::PartialBatch);
    let failure = error.batch_failure().expect("compound failure");
    assert_eq!(ids(&failure.successful), vec![1, 2, 5]);
    assert_eq!(failure.not_found, vec![json!({"id": 3})]);
    assert_eq!(failure.failed.len(), 1);
    assert_eq!(failure.failed[0].item, json!({"id": 4}));
    assert!(!failure.failed[0].cause.is_not_found());
    assert!(matches!(*failure.failed[0].cause, ClientError::ChunkRejected(_)));
}

#[tokio::test]
async fn unknown_singleton_degrades_to_none_but_batches_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/byids")))
        .respond_with(common::missing(json!([{"id": 7}])))
        .expect(2)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");

    let single = client
        .retrieve_multiple(
            &assets(),
            &IdentifierSequence::single(Identifier::Id(7)),
            RetrieveOptions::default(),
        )
        .await
        .expect("absent value");
    assert_eq!(single, Retrieved::Single(None));

    let batch = client
        .retrieve_multiple(
            &assets(),
            &IdentifierSequence::new(vec![Identifier::Id(7)]),
            RetrieveOptions::default(),
        )
        .await
        .expect_err("batches list unresolved identifiers");
    let failure = batch.batch_failure().expect("compound failure");
    assert_eq!(failure.not_found, vec![json!({"id": 7})]);
    assert!(failure.failed.is_empty());
}

#[tokio::test]
async fn ignoring_unknown_ids_yields_an_empty_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/byids")))
        .and(body_json(json!({"items": [{"id": 7}], "ignoreUnknownIds": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let options = RetrieveOptions {
        ignore_unknown_ids: true,
        ..RetrieveOptions::default()
    };
    let retrieved = client
        .retrieve_multiple(&assets(), &IdentifierSequence::new(vec![Identifier::Id(7)]), options)
        .await
        .expect("empty result");
    assert_eq!(retrieved, Retrieved::List(Vec::new()));
}

#[tokio::test]
async fn empty_input_fails_without_sending_anything() {
    let server = MockServer::start().await;
    let client = ApiClient::new(common::config(&server.uri())).expect("client");

    let error = client
        .retrieve_multiple(
            &assets(),
            &IdentifierSequence::new(Vec::new()),
            RetrieveOptions::default(),
        )
        .await
        .expect_err("empty input");
    assert!(matches!(error, ClientError::EmptyInput));
    assert_eq!(error.kind(), ErrorKind::Programming);

    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests.is_empty());
}

#[tokio::test]
async fn upsert_creates_missing_items_and_updates_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/update")))
        .respond_with(|request: &Request| -> ResponseTemplate {
            let items = common::body_of(request)["items"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            if items.iter().any(|item| item["externalId"] == "new") {
                return common::missing(json!([{"externalId": "new"}]));
            }
            let stored: Vec<Value> = items
                .iter()
                .map(|item| {
                    json!({
                        "externalId": item["externalId"],
                        "name": item["update"]["name"]["set"],
                    })
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({"items": stored}))
        })
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets")))
        .and(body_json(json!({"items": [{"externalId": "new", "name": "fresh"}]})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "items": [{"id": 2, "externalId": "new", "name": "fresh"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let stored = client
        .upsert(
            &assets(),
            vec![
                json!({"externalId": "old", "name": "renamed"}),
                json!({"externalId": "new", "name": "fresh"}),
            ],
            UpdateMode::Replace,
            WriteOptions::default(),
        )
        .await
        .expect("upserted");

    let names: Vec<&str> = stored.iter().filter_map(|item| item["name"].as_str()).collect();
    assert_eq!(names, vec!["renamed", "fresh"]);
}

#[tokio::test]
async fn deletes_in_one_request_per_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/delete")))
        .and(body_json(json!({
            "items": [{"id": 1}, {"externalId": "x"}],
            "ignoreUnknownIds": true
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let options = DeleteOptions {
        ignore_unknown_ids: true,
        ..DeleteOptions::default()
    };
    client
        .delete_multiple(&assets(), &IdentifierSequence::load(&[1], &["x"]), options)
        .await
        .expect("deleted");
}

#[tokio::test]
async fn aggregate_returns_items() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/aggregate")))
        .and(body_json(json!({"filter": {"name": "pump"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"count": 3}]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let counts = client
        .aggregate(&assets(), json!({"filter": {"name": "pump"}}))
        .await
        .expect("aggregate");
    assert_eq!(counts, vec![json!({"count": 3})]);
}

#[tokio::test]
async fn list_stops_at_the_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/list")))
        .respond_with(common::collection(12))
        .expect(3)
        .mount(&server)
        .await;

    let config = common::config(&server.uri()).with_limits(uniform_limits(2));
    let client = ApiClient::new(config).expect("client");
    let items = client
        .list(&assets(), ListRequest::post().with_limit(5))
        .await
        .expect("items");
    assert_eq!(ids(&items), vec![0, 1, 2, 3, 4]);

    let requested: Vec<Value> = server
        .received_requests()
        .await
        .expect("recording enabled")
        .iter()
        .map(|request| common::body_of(request)["limit"].clone())
        .collect();
    assert_eq!(requested, vec![json!(2), json!(2), json!(1)]);
}

#[tokio::test]
async fn chunks_regroup_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/list")))
        .respond_with(common::collection(10))
        .mount(&server)
        .await;

    let config = common::config(&server.uri()).with_limits(uniform_limits(3));
    let client = ApiClient::new(config).expect("client");

    let chunks: Vec<Vec<Value>> = client
        .list_chunks(&assets(), ListRequest::post(), 4)
        .try_collect()
        .await
        .expect("chunks");
    let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let flat = client.list(&assets(), ListRequest::post()).await.expect("items");
    assert_eq!(chunks.concat(), flat);
}

#[tokio::test]
async fn abandoning_a_stream_fetches_no_more_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/list")))
        .respond_with(common::collection(100))
        .expect(1)
        .mount(&server)
        .await;

    let config = common::config(&server.uri()).with_limits(uniform_limits(10));
    let client = ApiClient::new(config).expect("client");

    let first: Vec<Value> = client
        .list_stream(&assets(), ListRequest::post())
        .take(3)
        .try_collect()
        .await
        .expect("items");
    assert_eq!(ids(&first), vec![0, 1, 2]);
}

#[tokio::test]
async fn partitions_are_merged_in_partition_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(common::path("/assets/list")))
        .respond_with(|request: &Request| -> ResponseTemplate {
            let items = match common::body_of(request)["partition"].as_str() {
                Some("1/3") => json!([{"id": 10}, {"id": 11}]),
                Some("2/3") => json!([{"id": 20}]),
                Some("3/3") => json!([{"id": 30}]),
                _ => return ResponseTemplate::new(400),
            };
            ResponseTemplate::new(200).set_body_json(json!({"items": items}))
        })
        .expect(3)
        .mount(&server)
        .await;

    let client = ApiClient::new(common::config(&server.uri())).expect("client");
    let items = client
        .list_partitioned(&assets(), ListRequest::post(), 3)
        .await
        .expect("items");
    assert_eq!(ids(&items), vec![10, 11, 20, 30]);

    let error = client
        .list_partitioned(&assets(), ListRequest::post().with_limit(5), 3)
        .await
        .expect_err("limit with partitions");
    assert_eq!(error.kind(), ErrorKind::Programming);
}
