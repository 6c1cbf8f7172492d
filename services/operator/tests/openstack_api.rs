//! OpenStack client against a stubbed Keystone and Nova.

use std::sync::Arc;
use std::time::Duration;

use obsidian_operator::cloud::{
    CloudClient, CloudError, CloudProvisioner, InstanceDefaults, InstanceSpec, OpenStackClient,
};
use obsidian_operator::config::{CloudConfig, Secret};
use obsidian_operator::request::RequestId;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cloud_config(server: &MockServer) -> CloudConfig {
    CloudConfig {
        auth_url: format!("{}/v3", server.uri()),
        compute_url: format!("{}/v2.1", server.uri()),
        username: "operator".into(),
        password: Secret::new("hunter2"),
        project_id: "proj-1".into(),
        domain_id: "default".into(),
        image_ref: "image-1".into(),
        flavor_ref: "flavor-1".into(),
        network_id: "net-1".into(),
        request_timeout: Duration::from_secs(5),
    }
}

async fn mount_keystone(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/v3/auth/tokens"))
        .and(body_partial_json(json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {"user": {"name": "operator", "password": "hunter2"}}
                },
                "scope": {"project": {"id": "proj-1"}}
            }
        })))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("X-Subject-Token", token)
                .set_body_json(json!({"token": {"expires_at": "2099-01-01T00:00:00Z"}})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_authenticate_reads_subject_token() {
    let server = MockServer::start().await;
    mount_keystone(&server, "tok-1").await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let token = client.authenticate().await.unwrap();
    assert_eq!(token.token, "tok-1");
    assert_eq!(token.expires_at.to_rfc3339(), "2099-01-01T00:00:00+00:00");
}

#[tokio::test]
async fn test_rejected_credentials_are_auth_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/auth/tokens"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": 401, "message": "The request you have made requires authentication."}
        })))
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let err = client.authenticate().await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn test_create_server_sends_token_and_spec() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2.1/servers"))
        .and(header("X-Auth-Token", "tok-1"))
        .and(body_partial_json(json!({
            "server": {
                "name": "Instance-7",
                "imageRef": "image-1",
                "flavorRef": "flavor-1",
                "networks": [{"uuid": "net-1"}]
            }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"server": {"id": "srv-7"}})))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let spec = InstanceSpec {
        name: "Instance-7".into(),
        image_ref: "image-1".into(),
        flavor_ref: "flavor-1".into(),
        network_id: "net-1".into(),
    };
    let created = client.create_server("tok-1", &spec).await.unwrap();
    assert_eq!(created.id, "srv-7");
    assert_eq!(created.name, "Instance-7");
}

#[tokio::test]
async fn test_quota_rejection_carries_provider_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2.1/servers"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "forbidden": {"code": 403, "message": "QuotaExceeded"}
        })))
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let spec = InstanceSpec {
        name: "Instance-7".into(),
        image_ref: "image-1".into(),
        flavor_ref: "flavor-1".into(),
        network_id: "net-1".into(),
    };
    let err = client.create_server("tok-1", &spec).await.unwrap_err();
    assert_eq!(err, CloudError::Provision("QuotaExceeded".into()));
    assert_eq!(err.to_string(), "QuotaExceeded");
}

#[tokio::test]
async fn test_find_server_matches_exact_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2.1/servers"))
        .and(query_param("name", "^Instance-7$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": [
                {"id": "srv-7", "name": "Instance-7"}
            ]
        })))
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let found = client.find_server("tok-1", "Instance-7").await.unwrap().unwrap();
    assert_eq!(found.id, "srv-7");
}

#[tokio::test]
async fn test_list_servers_filters_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2.1/servers"))
        .and(query_param("name", "^Instance-"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": [
                {"id": "srv-1", "name": "Instance-1"},
                {"id": "srv-x", "name": "web-Instance-9"},
                {"id": "srv-2", "name": "Instance-standing-01hv4z2wqx"}
            ]
        })))
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    let ids: Vec<String> = client
        .list_servers("tok-1", "Instance-")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["srv-1", "srv-2"]);
}

#[tokio::test]
async fn test_delete_missing_server_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2.1/servers/srv-gone"))
        .and(header("X-Auth-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenStackClient::new(cloud_config(&server)).unwrap();
    client.delete_server("tok-1", "srv-gone").await.unwrap();
}

#[tokio::test]
async fn test_provisioner_reuses_server_found_by_name() {
    let server = MockServer::start().await;
    mount_keystone(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/v2.1/servers"))
        .and(header("X-Auth-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": [{"id": "srv-7", "name": "Instance-7"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2.1/servers"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"server": {"id": "srv-dup"}})))
        .expect(0)
        .mount(&server)
        .await;

    let config = cloud_config(&server);
    let client = OpenStackClient::new(config.clone()).unwrap();
    let provisioner = CloudProvisioner::new(
        Arc::new(client),
        InstanceDefaults::from(&config),
        config.request_timeout,
    );

    let request_id = RequestId::new(7);
    let instance = provisioner
        .ensure_instance(&request_id.instance_name(), request_id)
        .await
        .unwrap();
    assert!(instance.reused);
    assert_eq!(instance.cloud_instance_id, "srv-7");
    assert_eq!(instance.request_id, Some(request_id));
}
