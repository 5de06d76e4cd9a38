use crate::config::Config;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};

/// Marks a deployment of this service version on the Kibana APM timeline.
/// No-op when `KB_URL` is not configured.
pub async fn post_deployment_annotation(
    http: &Client,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(kibana_url) = config.kibana_url.as_deref() else {
        return Ok(());
    };
    let url = format!(
        "{kibana_url}/api/apm/services/{}/annotation",
        config.apm_service_name
    );
    let payload = json!({
        "@timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "service": {
            "version": config.apm_service_version,
            "environment": config.apm_environment,
        },
        "message": config.apm_service_version,
    });

    let mut request = http.post(&url).header("kbn-xsrf", "true").json(&payload);
    if let Some(username) = &config.es_username {
        request = request.basic_auth(username, config.es_password.as_deref());
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("post annotation to {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("kibana rejected annotation ({status}): {body}");
    }
    let body: JsonValue = response.json().await.unwrap_or_default();
    tracing::info!(
        service = %config.apm_service_name,
        version = %config.apm_service_version,
        id = body["_id"].as_str().unwrap_or_default(),
        "posted APM deployment annotation"
    );
    Ok(())
}
