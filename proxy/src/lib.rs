pub mod assets;
pub mod config;
pub mod email;
pub mod email_form;
pub mod errors;
pub mod metrics_defs;
pub mod pipeline;
mod proxy_service;
pub mod rule_store;
pub mod secrets;
pub mod session;
pub mod upstream;

#[cfg(test)]
mod testutils;

use assets::{NotFoundAssets, StaticAssets, UpstreamAssets};
use bytes::Bytes;
use config::{Config, SecretsConfig, StaticAssetsConfig};
use email::{EmailService, HttpEmailService, NoEmailService};
use email_form::EmailFormHandler;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use pipeline::Pipeline;
use proxy_service::ProxyService;
use rule_store::{RuleSetProvider, RuleStore, StoreError};
use rules::{EdgeAuthBinding, edge_bindings};
use secrets::{EnvSecrets, PlaintextSecrets, SecretStore};
use session::{HttpSessionAuth, NoSessionAuth, SessionAuth};
use shared::admin_service::AdminService;
use shared::http::{make_error_response, run_http_service};
use std::sync::Arc;
use std::time::Duration;
use upstream::UpstreamClient;

pub use errors::ProxyError;

pub async fn run(config: Config) -> Result<(), ProxyError> {
    let store = Arc::new(build_rule_store(&config)?);
    let pipeline = build_pipeline(&config, store.clone())?;

    let proxy_service = ProxyService::new(Arc::new(pipeline), config.max_body_bytes);
    let admin_service = AdminService::new(|| true).with_route(
        "/edge/auth-transforms",
        Arc::new(move || edge_contract_response(&store)),
    );

    let proxy_task = run_http_service(&config.listener.host, config.listener.port, proxy_service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}

/// Loads the configured rule sets and host mappings into a fresh store.
pub fn build_rule_store(config: &Config) -> Result<RuleStore, StoreError> {
    let store = RuleStore::from_records(config.rule_sets.clone())?;
    for (host, rule_set_id) in &config.hosts {
        store.map_host(host, rule_set_id)?;
    }
    Ok(store)
}

/// Wires the collaborators named in the config around `rules`.
pub fn build_pipeline(
    config: &Config,
    rules: Arc<dyn RuleSetProvider>,
) -> Result<Pipeline, ProxyError> {
    let assets: Arc<dyn StaticAssets> = match &config.static_assets {
        StaticAssetsConfig::Upstream { url, timeout_ms } => Arc::new(UpstreamAssets::new(
            url.clone(),
            Duration::from_millis(*timeout_ms),
        )?),
        StaticAssetsConfig::NotFound => Arc::new(NotFoundAssets),
    };

    let secrets: Arc<dyn SecretStore> = match config.secrets {
        SecretsConfig::Env => Arc::new(EnvSecrets),
        SecretsConfig::Plaintext => {
            tracing::warn!("Sealed header values are read as plaintext");
            Arc::new(PlaintextSecrets)
        }
    };

    let (email, send_timeout_ms): (Arc<dyn EmailService>, u64) = match &config.email {
        Some(email) => (
            Arc::new(HttpEmailService::new(email.url.clone(), email.api_key.clone())),
            email.send_timeout_ms,
        ),
        None => (
            Arc::new(NoEmailService),
            config::DEFAULT_EMAIL_SEND_TIMEOUT_MS,
        ),
    };

    let sessions: Arc<dyn SessionAuth> = match &config.session_auth {
        Some(session) => Arc::new(HttpSessionAuth::new(
            session.url.clone(),
            Duration::from_millis(session.timeout_ms),
        )?),
        None => Arc::new(NoSessionAuth),
    };

    Ok(Pipeline::new(
        rules,
        assets,
        secrets,
        UpstreamClient::new()?,
        EmailFormHandler::new(email, sessions, Duration::from_millis(send_timeout_ms)),
    ))
}

/// Every cookie-to-bearer binding the edge tier has to render, across all rule sets.
pub fn edge_contract(store: &RuleStore) -> Vec<EdgeAuthBinding> {
    store
        .rule_sets()
        .iter()
        .flat_map(|rule_set| edge_bindings(rule_set))
        .collect()
}

fn edge_contract_response(store: &RuleStore) -> Response<Bytes> {
    match serde_json::to_vec(&edge_contract(store)) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize edge contract");
            make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn config() -> Config {
        serde_yaml::from_str(
            r#"
listener:
  host: 127.0.0.1
  port: 3000
admin_listener:
  host: 127.0.0.1
  port: 3001
hosts:
  site.example.com: rs1
rule_sets:
  - id: rs1
    projectId: p1
    name: main
    rules:
      - id: app
        pathPattern: /app/*
        targetUrl: https://api.example.com
        stripPrefix: true
        authTransform:
          type: cookie-to-bearer
          cookieName: session
      - id: disabled
        pathPattern: /old/*
        targetUrl: https://api.example.com
        isEnabled: false
        authTransform:
          type: cookie-to-bearer
          cookieName: session
      - id: docs
        pathPattern: /docs/*
        proxyType: internal_rewrite
        targetUrl: /documentation
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_edge_contract() {
        let config = config();
        config.validate().unwrap();
        let store = build_rule_store(&config).unwrap();

        let response = edge_contract_response(&store);
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!([{
                "ruleSetId": "rs1",
                "ruleId": "app",
                "pathPattern": "/app/*",
                "targetUrl": "https://api.example.com/",
                "stripPrefix": true,
                "preserveHost": false,
                "timeoutMs": 30000,
                "authTransform": {"type": "cookie-to-bearer", "cookieName": "session"}
            }])
        );
    }

    #[tokio::test]
    async fn test_build_pipeline() {
        let config = config();
        let store = Arc::new(build_rule_store(&config).unwrap());
        let pipeline = build_pipeline(&config, store).unwrap();

        let request = Request::builder()
            .uri("/anything")
            .header(http::header::HOST, "site.example.com")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
