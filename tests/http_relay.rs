//! Plain HTTP forwarding through the proxy.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use relay_proxy::config::HostHeaderPolicy;
use relay_proxy::http::{ForwardedRequest, ForwardingPolicy, TargetPolicy};
use relay_proxy::websocket::RebaseOnTarget;
use relay_proxy::HttpServer;
use tokio::time::timeout;
use url::Url;

use common::WAIT;

mod common;

#[tokio::test]
async fn rewrites_host_and_sets_empty_user_agent() {
    let backend = common::start_echo_backend().await;
    let proxy = common::start_proxy(common::config_for(&format!("http://{backend}"))).await;

    let response = common::client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-echo-host"], backend.to_string().as_str());
    assert_eq!(response.headers()["x-echo-user-agent"], "");
    assert!(response.headers().get("x-echo-user-agent-absent").is_none());
}

#[tokio::test]
async fn preserves_method_path_query_body_and_user_agent() {
    let backend = common::start_echo_backend().await;
    let proxy = common::start_proxy(common::config_for(&format!("http://{backend}"))).await;

    let response = common::client()
        .post(format!("http://{proxy}/api/items?page=2&sort=desc"))
        .header("user-agent", "integration/1.0")
        .body("hello backend")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-echo-method"], "POST");
    assert_eq!(response.headers()["x-echo-uri"], "/api/items?page=2&sort=desc");
    assert_eq!(response.headers()["x-echo-user-agent"], "integration/1.0");
    assert_eq!(response.text().await.unwrap(), "hello backend");
}

#[tokio::test]
async fn relays_non_success_and_redirect_statuses_unchanged() {
    let backend = common::start_echo_backend().await;
    let mut config = common::config_for(&format!("http://{backend}"));
    config.observability.debug = true;
    let proxy = common::start_proxy(config).await;
    let client = common::client();

    let missing = client.get(format!("http://{proxy}/status/404")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let redirect = client.get(format!("http://{proxy}/redirect")).send().await.unwrap();
    assert_eq!(redirect.status(), StatusCode::FOUND);
    assert_eq!(redirect.headers()["location"], "/elsewhere");
}

#[tokio::test]
async fn refused_target_is_bad_gateway() {
    let dead = common::closed_port().await;
    let proxy = common::start_proxy(common::config_for(&format!("http://{dead}"))).await;

    let response = common::client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn tunnels_through_upstream_proxy() {
    let backend = common::start_echo_backend().await;
    let upstream = common::MockForwardProxy::start().await;

    let mut config = common::config_for(&format!("http://{backend}"));
    config.upstream_proxy = Some(Url::parse(&upstream.url()).unwrap());
    let proxy = common::start_proxy(config).await;

    let response = common::client()
        .get(format!("http://{proxy}/via/proxy"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-echo-host"], backend.to_string().as_str());
    assert!(upstream.connections() >= 1);
    let lines = upstream.request_lines();
    assert!(
        lines[0].starts_with(&format!("GET http://{backend}/via/proxy")),
        "unexpected request line {lines:?}"
    );
}

#[tokio::test]
async fn upstream_host_policy_sends_proxy_authority() {
    let backend = common::start_echo_backend().await;
    let upstream = common::MockForwardProxy::start().await;

    let mut config = common::config_for(&format!("http://{backend}"));
    config.upstream_proxy = Some(Url::parse(&upstream.url()).unwrap());
    config.host_header = HostHeaderPolicy::UpstreamProxy;
    let proxy = common::start_proxy(config).await;

    let response = common::client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()["x-echo-host"], upstream.addr.to_string().as_str());
}

#[tokio::test]
async fn connection_cap_queues_rather_than_fails() {
    let backend = common::start_echo_backend().await;
    let mut config = common::config_for(&format!("http://{backend}"));
    config.pool.max_connections = 1;
    config.pool.max_per_host = 1;
    let proxy = common::start_proxy(config).await;
    let client = common::client();

    let requests = (0..4).map(|i| {
        let client = client.clone();
        async move {
            client
                .post(format!("http://{proxy}/n/{i}"))
                .body(format!("body-{i}"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        }
    });
    let bodies = futures_util::future::join_all(requests).await;

    for (i, body) in bodies.iter().enumerate() {
        assert_eq!(body, &format!("body-{i}"));
    }
}

#[tokio::test]
async fn streams_response_chunks_as_they_arrive() {
    let (backend, release) = common::start_chunked_backend().await;
    let proxy = common::start_proxy(common::config_for(&format!("http://{backend}"))).await;

    let mut response = common::client()
        .get(format!("http://{proxy}/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The backend holds the second chunk until released.
    let first = timeout(WAIT, response.chunk()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.as_ref(), b"first");

    release.send(()).unwrap();
    let mut rest = Vec::new();
    while let Some(chunk) = timeout(WAIT, response.chunk()).await.unwrap().unwrap() {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, b"second");
}

#[tokio::test]
async fn self_signed_backend_needs_insecure_mode() {
    let backend = common::start_tls_backend().await;
    let target = format!("https://{backend}");

    let strict = common::start_proxy(common::config_for(&target)).await;
    let response = common::client().get(format!("http://{strict}/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let mut config = common::config_for(&target);
    config.tls.insecure_skip_verify = true;
    let insecure = common::start_proxy(config).await;
    let response = common::client().get(format!("http://{insecure}/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "secure");
}

/// Prefixes every forwarded path with `/v2`.
struct VersionedPolicy(TargetPolicy);

impl ForwardingPolicy for VersionedPolicy {
    fn forward(&self, request: Request<Body>) -> ForwardedRequest {
        let mut forwarded = self.0.forward(request);
        let path = format!("/v2{}", forwarded.url.path());
        forwarded.url.set_path(&path);
        forwarded
    }
}

#[tokio::test]
async fn injected_forwarding_policy_rewrites_requests() {
    let backend = common::start_echo_backend().await;
    let config = common::config_for(&format!("http://{backend}"));
    let policy = Arc::new(VersionedPolicy(TargetPolicy::from_config(&config)));
    let server = HttpServer::new(config)
        .unwrap()
        .with_strategies(policy, Arc::new(RebaseOnTarget))
        .unwrap();
    let proxy = common::start_server(server).await;

    let response = common::client()
        .get(format!("http://{proxy}/items?id=3"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-echo-uri"], "/v2/items?id=3");
    assert_eq!(response.headers()["x-echo-host"], backend.to_string().as_str());
}
