use std::collections::BTreeMap;
use std::time::Duration;

use dispatch::{Backoff, CiEndpoint, CiTriggerClient, JobName, TriggerError, TriggerInvocation};
use httpmock::prelude::*;
use jenkins::{JenkinsClient, JenkinsConfig, JenkinsInstance};

// base64("relay:s3cret")
const BASIC_AUTH: &str = "Basic cmVsYXk6czNjcmV0";

fn client(server: &MockServer, max_attempts: u32) -> JenkinsClient {
    JenkinsClient::new(JenkinsConfig {
        instances: vec![JenkinsInstance {
            url: server.base_url(),
            user: "relay".to_string(),
            api_token: "s3cret".to_string(),
        }],
        request_timeout: Duration::from_secs(2),
        backoff: Backoff {
            max_attempts,
            base_delay: Duration::from_millis(1),
        },
    })
    .unwrap()
}

fn invocation(server: &MockServer, job: &str, params: &[(&str, &str)]) -> TriggerInvocation {
    TriggerInvocation {
        job_name: JobName::new(job).unwrap(),
        ci_endpoint: CiEndpoint::new(server.base_url()).unwrap(),
        parameters: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

#[tokio::test]
async fn parameterized_jobs_post_form_data() {
    let server = MockServer::start_async().await;
    let build = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/job/team/job/deploy/buildWithParameters")
                .header("authorization", BASIC_AUTH)
                .x_www_form_urlencoded_tuple("env", "staging")
                .x_www_form_urlencoded_tuple("region", "us");
            then.status(201);
        })
        .await;

    client(&server, 1)
        .trigger(&invocation(&server, "team/deploy", &[("env", "staging"), ("region", "us")]))
        .await
        .unwrap();

    build.assert_async().await;
}

#[tokio::test]
async fn jobs_without_parameters_use_plain_build() {
    let server = MockServer::start_async().await;
    let build = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/job/nightly/build")
                .header("authorization", BASIC_AUTH);
            then.status(201);
        })
        .await;

    client(&server, 1)
        .trigger(&invocation(&server, "nightly", &[]))
        .await
        .unwrap();

    build.assert_async().await;
}

#[tokio::test]
async fn unknown_endpoints_fail_without_a_request() {
    let server = MockServer::start_async().await;
    let any = server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(201);
        })
        .await;
    let mut request = invocation(&server, "nightly", &[]);
    request.ci_endpoint = CiEndpoint::new("https://elsewhere.example.com").unwrap();

    let err = client(&server, 3).trigger(&request).await.unwrap_err();

    assert!(matches!(err, TriggerError::UnknownEndpoint(_)));
    assert_eq!(any.hits_async().await, 0);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/job/nightly/build");
            then.status(503).body("restarting");
        })
        .await;

    let err = client(&server, 2)
        .trigger(&invocation(&server, "nightly", &[]))
        .await
        .unwrap_err();

    assert_eq!(failing.hits_async().await, 2);
    assert!(matches!(err, TriggerError::Rejected { status: 503, .. }));
}

#[tokio::test]
async fn missing_jobs_are_not_retried() {
    let server = MockServer::start_async().await;
    let missing = server
        .mock_async(|when, then| {
            when.method(POST).path("/job/ghost/build");
            then.status(404).body("no such job");
        })
        .await;

    let err = client(&server, 3)
        .trigger(&invocation(&server, "ghost", &[]))
        .await
        .unwrap_err();

    assert_eq!(missing.hits_async().await, 1);
    assert!(!err.retry_policy().is_retryable());
}
