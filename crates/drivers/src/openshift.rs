//! OpenShift specifics: the challenging-client token exchange and the
//! group resources (Route, ProjectRequest) that plain Kubernetes lacks.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use reqwest::header::AUTHORIZATION;
use serde_json::json;

use models::Session;

use crate::DriverError;

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    /// Unix epoch seconds.
    pub expires_at: i64,
}

/// Fetches a bearer token from the cluster's OAuth server with the
/// challenging-client flow. The server answers with a redirect whose
/// fragment carries the token and its lifetime; redirects must not be
/// followed.
pub async fn request_token(
    cluster: &str,
    base_url: &str,
    user: &str,
    password: &str,
) -> Result<OAuthToken, DriverError> {
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let auth = STANDARD.encode(format!("{user}:{password}"));
    let resp = http
        .get(format!("{}/oauth/authorize", base_url.trim_end_matches('/')))
        .query(&[
            ("response_type", "token"),
            ("client_id", "openshift-challenging-client"),
        ])
        .header(AUTHORIZATION, format!("Basic {auth}"))
        .header("X-Csrf-Token", "1")
        .send()
        .await?;

    let location = resp
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| DriverError::TokenRequest {
            cluster: cluster.to_string(),
            reason: format!("no redirect in response, status {}", resp.status()),
        })?;

    let (access_token, expires_in) =
        parse_token_fragment(location).ok_or_else(|| DriverError::TokenRequest {
            cluster: cluster.to_string(),
            reason: "redirect fragment carries no token".to_string(),
        })?;

    Ok(OAuthToken {
        access_token,
        expires_at: Utc::now().timestamp() + expires_in,
    })
}

/// Extracts `access_token` and `expires_in` from a redirect URL fragment.
pub(crate) fn parse_token_fragment(location: &str) -> Option<(String, i64)> {
    let fragment = location.split('#').nth(1)?;
    let mut access_token = None;
    let mut expires_in = None;
    for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
        match key.as_ref() {
            "access_token" => access_token = Some(value.into_owned()),
            "expires_in" => expires_in = value.parse().ok(),
            _ => {}
        }
    }
    Some((access_token?, expires_in?))
}

pub fn route_api(client: Client, namespace: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
    Api::namespaced_with(client, namespace, &ApiResource::from_gvk(&gvk))
}

pub fn route_object(session: &Session, host: &str) -> DynamicObject {
    let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
    let resource = ApiResource::from_gvk(&gvk);
    DynamicObject::new(&session.name, &resource).data(json!({
        "spec": {
            "host": host,
            "to": {"kind": "Service", "name": session.name},
            "port": {"targetPort": 80},
        }
    }))
}

pub fn project_request_api(client: Client) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("project.openshift.io", "v1", "ProjectRequest");
    Api::all_with(client, &ApiResource::from_gvk(&gvk))
}

pub fn project_request_object(namespace: &str) -> DynamicObject {
    let gvk = GroupVersionKind::gvk("project.openshift.io", "v1", "ProjectRequest");
    let resource = ApiResource::from_gvk(&gvk);
    DynamicObject::new(namespace, &resource)
}
