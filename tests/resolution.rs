use std::time::Duration;

use anyhow::Result;
use httptest::{matchers::*, responders::*, Expectation, Server};
use serde_json::json;
use tonga::{FlagValue, TongaClient, TongaOptions};

use common::{allow_analytics_reports, create_client, server_url};

pub mod common;

#[tokio::test]
async fn test_on_demand_fetch_single_non_existing_flag() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    // A single request: the 404 is cached as absence and never re-queried.
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(1)
            .respond_with(status_code(404)),
    );

    let mut client = create_client(&http_server);
    assert_eq!(client.get("flag_name").await?, None);
    assert_eq!(client.get("flag_name").await?, None);
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_on_demand_fetch_single_no_value_in_response() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(1)
            .respond_with(json_encoded(json!({}))),
    );

    let mut client = create_client(&http_server);
    assert_eq!(client.get("flag_name").await?, None);
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_on_demand_fetch_single_boolean_flag() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(1)
            .respond_with(json_encoded(json!({"value": true}))),
    );

    let mut client = create_client(&http_server);
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::Bool(true)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_on_demand_fetch_bare_body_value() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    // Some server variants return the bare value instead of {"value": ...}.
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(1)
            .respond_with(json_encoded(json!(true))),
    );

    let mut client = create_client(&http_server);
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::Bool(true)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_cached_result_yields_single_network_call() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(1)
            .respond_with(json_encoded(json!({"value": 2}))),
    );

    let mut client = create_client(&http_server);
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::from(2)));
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::from(2)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_context_attributes_scope_resolution() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/flag_value/flag_name"),
            request::query(url_decoded(contains(("user", "some user1")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({"value": true}))),
    );
    http_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/flag_value/flag_name"),
            request::query(url_decoded(contains(("user", "some user2")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({"value": false}))),
    );

    let mut client1 = TongaClient::builder(server_url(&http_server))
        .context_attribute("user", "some user1")
        .context_attribute("some_attribute", "2")
        .build()?;
    assert_eq!(client1.get("flag_name").await?, Some(FlagValue::Bool(true)));

    let mut client2 = TongaClient::builder(server_url(&http_server))
        .context_attribute("user", "some user2")
        .context_attribute("some_attribute", "2")
        .build()?;
    assert_eq!(client2.get("flag_name").await?, Some(FlagValue::Bool(false)));

    client1.close().await;
    client2.close().await;
    Ok(())
}

#[tokio::test]
async fn test_request_attributes_sent_as_headers() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/flag_value/flag_name"),
            request::headers(contains(("x-tonga-attr1", "val1"))),
            request::headers(not(contains(key("x-tonga-attr2")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({"value": true}))),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .request_attributes(
            [
                ("attr1".to_string(), Some("val1".to_string())),
                ("attr2".to_string(), None),
            ]
            .into(),
        )
        .build()?;
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::Bool(true)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unicode_request_attribute_value() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/flag_value/flag_name"),
            request::headers(contains(("x-tonga-attr1", "PróUrbano SP"))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({"value": true}))),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .request_attribute("attr1", "PróUrbano SP")
        .build()?;
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::Bool(true)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_succeeds_within_bound() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(3)
            .respond_with(cycle![
                status_code(500),
                status_code(500),
                json_encoded(json!({"value": "ok"})),
            ]),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .options(TongaOptions {
            retries: 2,
            retry_delay: Duration::from_millis(10),
            ..TongaOptions::default()
        })
        .build()?;
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::from("ok")));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_exhaustion_propagates_failure() -> Result<()> {
    let http_server = Server::run();
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(2)
            .respond_with(status_code(500)),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .options(TongaOptions {
            retries: 1,
            retry_delay: Duration::from_millis(10),
            ..TongaOptions::default()
        })
        .build()?;
    assert!(client.get("flag_name").await.is_err());
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_fetch_leaves_cache_unmodified() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/flag_value/flag_name"))
            .times(2)
            .respond_with(cycle![status_code(500), json_encoded(json!({"value": true}))]),
    );

    let mut client = create_client(&http_server);
    assert!(client.get("flag_name").await.is_err());
    // The failure was not cached, so the next call retries from scratch.
    assert_eq!(client.get("flag_name").await?, Some(FlagValue::Bool(true)));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_offline_mode_makes_no_requests() -> Result<()> {
    // No expectations at all: any request would fail the test on verify.
    let http_server = Server::run();

    let mut client = TongaClient::builder(server_url(&http_server))
        .options(TongaOptions {
            offline_mode: true,
            ..TongaOptions::default()
        })
        .build()?;
    assert_eq!(client.get_or("flag_name", false).await?, Some(FlagValue::Bool(false)));
    assert_eq!(client.get("other_flag").await?, None);
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_pre_fetch_flattens_bulk_response() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    // One bulk call serves every flag; a /flag_value request would be
    // unexpected and fail the test.
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/all_flags_values"))
            .times(1)
            .respond_with(json_encoded(json!({
                "flag1": true,
                "parent": {"child": 2},
            }))),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .options(TongaOptions {
            pre_fetch: true,
            ..TongaOptions::default()
        })
        .build()?;
    assert_eq!(client.get("flag1").await?, Some(FlagValue::Bool(true)));
    assert_eq!(client.get("parent.child").await?, Some(FlagValue::from(2)));
    // Absent from the one-time bulk response resolves to absent, no refetch.
    assert_eq!(client.get("missing").await?, None);
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_pre_fetch_treats_404_as_empty() -> Result<()> {
    let http_server = Server::run();
    allow_analytics_reports(&http_server);
    http_server.expect(
        Expectation::matching(request::method_path("GET", "/all_flags_values"))
            .times(1)
            .respond_with(status_code(404)),
    );

    let mut client = TongaClient::builder(server_url(&http_server))
        .options(TongaOptions {
            pre_fetch: true,
            ..TongaOptions::default()
        })
        .build()?;
    assert_eq!(client.get("flag1").await?, None);
    assert_eq!(client.get("flag2").await?, None);
    client.close().await;
    Ok(())
}
