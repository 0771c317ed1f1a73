// Per-request driver: find the rule set for the host, resolve the winning rule and
// hand the request to the matching action.

use crate::assets::StaticAssets;
use crate::email_form::EmailFormHandler;
use crate::errors::ProxyError;
use crate::metrics_defs::RULE_RESOLVED;
use crate::rule_store::{RuleSetProvider, StoreError};
use crate::secrets::{SecretStore, reveal_headers};
use crate::upstream::{UpstreamClient, join_paths, target_authority, upstream_url};
use bytes::Bytes;
use http::Uri;
use http::header::HOST;
use hyper::{Request, Response};
use rules::{ExternalProxy, InternalRewrite, ProxyRule, ProxyRuleSet, RuleAction, compute_headers, resolve};
use shared::counter;
use std::sync::Arc;

pub struct Pipeline {
    rules: Arc<dyn RuleSetProvider>,
    assets: Arc<dyn StaticAssets>,
    secrets: Arc<dyn SecretStore>,
    upstream: UpstreamClient,
    email_forms: EmailFormHandler,
}

impl Pipeline {
    pub fn new(
        rules: Arc<dyn RuleSetProvider>,
        assets: Arc<dyn StaticAssets>,
        secrets: Arc<dyn SecretStore>,
        upstream: UpstreamClient,
        email_forms: EmailFormHandler,
    ) -> Self {
        Pipeline {
            rules,
            assets,
            secrets,
            upstream,
            email_forms,
        }
    }

    /// Serves a request for whichever site its host belongs to. Hosts without a
    /// rule set go straight to the asset store.
    pub async fn handle(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let host = request_host(&request).unwrap_or_default().to_string();
        let rule_set = self
            .rules
            .rule_set_for_host(&host)
            .await
            .map_err(|e| match e {
                StoreError::Misconfigured(e) => ProxyError::MisconfiguredRule(e),
                other => ProxyError::RuleStore(other),
            })?;
        match rule_set {
            Some(rule_set) => self.dispatch(&rule_set, request).await,
            None => self.assets.serve(request).await,
        }
    }

    /// Resolves the request path against one rule set snapshot and runs the winner.
    pub async fn dispatch(
        &self,
        rule_set: &ProxyRuleSet,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        let Some(rule) = resolve(rule_set, request.uri().path()) else {
            counter!(RULE_RESOLVED, "action" => "none").increment(1);
            return self.assets.serve(request).await;
        };

        let action = rule.action.proxy_type().as_str();
        counter!(RULE_RESOLVED, "action" => action).increment(1);
        tracing::debug!(
            rule_set_id = %rule_set.id,
            rule_id = %rule.id,
            action,
            path = request.uri().path(),
            "Resolved proxy rule"
        );

        match &rule.action {
            RuleAction::ExternalProxy(proxy) => self.proxy_external(rule, proxy, request).await,
            RuleAction::InternalRewrite(rewrite) => self.rewrite(rule, rewrite, request).await,
            RuleAction::EmailForm(config) => Ok(self.email_forms.handle(config, &request).await),
        }
    }

    async fn proxy_external(
        &self,
        rule: &ProxyRule,
        proxy: &ExternalProxy,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        if proxy.auth_transform.is_some() {
            return Err(ProxyError::EdgeOnlyRule(rule.id.clone()));
        }

        let original_host = request_host(&request).map(str::to_owned);
        let (parts, body) = request.into_parts();
        let url = match proxy.strip_prefix {
            true => upstream_url(
                &proxy.target,
                &rule.pattern.strip(parts.uri.path()),
                parts.uri.query(),
            ),
            false => upstream_url(&proxy.target, parts.uri.path(), parts.uri.query()),
        };

        let added = reveal_headers(self.secrets.as_ref(), &proxy.header_config).await?;
        let headers = compute_headers(
            &parts.headers,
            &proxy.header_config,
            &added,
            proxy.forward_cookies,
            proxy.preserve_host,
            original_host.as_deref(),
            &target_authority(&proxy.target),
        );

        self.upstream
            .send(parts.method, url, headers, body, parts.version, proxy.timeout)
            .await
    }

    async fn rewrite(
        &self,
        rule: &ProxyRule,
        rewrite: &InternalRewrite,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        let (mut parts, body) = request.into_parts();

        let path = match rewrite.strip_prefix {
            true => match &*rule.pattern.strip(parts.uri.path()) {
                "/" => rewrite.target_path.clone(),
                rest => join_paths(&rewrite.target_path, rest),
            },
            false => rewrite.target_path.clone(),
        };
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        tracing::debug!(
            rule_id = %rule.id,
            from = parts.uri.path(),
            to = %path_and_query,
            "Rewriting request"
        );
        parts.uri = path_and_query.parse::<Uri>()?;
        self.assets.serve(Request::from_parts(parts, body)).await
    }
}

fn request_host<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_store::RuleStore;
    use crate::secrets::PlaintextSecrets;
    use crate::session::NoSessionAuth;
    use crate::testutils::{RecordingAssets, RecordingEmailService, start_echo_server};
    use http::{StatusCode, Version};
    use http::header::{CONTENT_TYPE, COOKIE};
    use rules::{AuthTransform, EmailHandlerConfig, HeaderConfig, ProxyType, RuleRecord, RuleSetRecord, SealedValue};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        pipeline: Pipeline,
        store: Arc<RuleStore>,
        assets: Arc<RecordingAssets>,
        email: Arc<RecordingEmailService>,
    }

    fn harness(rules: Vec<RuleRecord>) -> Harness {
        let store = Arc::new(
            RuleStore::from_records(vec![RuleSetRecord {
                id: "rs1".into(),
                project_id: "p1".into(),
                name: "main".into(),
                description: None,
                environment: None,
                rules,
            }])
            .unwrap(),
        );
        store.map_host("site.example.com", "rs1").unwrap();

        let assets = Arc::new(RecordingAssets::default());
        let email = Arc::new(RecordingEmailService::default());
        let pipeline = Pipeline::new(
            store.clone(),
            assets.clone(),
            Arc::new(PlaintextSecrets),
            UpstreamClient::new().unwrap(),
            EmailFormHandler::new(email.clone(), Arc::new(NoSessionAuth), Duration::from_secs(1)),
        );
        Harness {
            pipeline,
            store,
            assets,
            email,
        }
    }

    fn external(id: &str, pattern: &str, port: u16, order: i32) -> RuleRecord {
        let mut record = RuleRecord::new(
            id,
            pattern,
            ProxyType::ExternalProxy,
            format!("http://127.0.0.1:{port}/v1"),
        );
        record.order = order;
        record
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder()
            .uri(uri)
            .header(HOST, "site.example.com")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_external_proxy() {
        let port = start_echo_server().await;
        let mut rule = external("api", "/api/*", port, 0);
        rule.strip_prefix = true;
        rule.header_config = HeaderConfig {
            forward: vec!["x-trace".into(), "content-type".into()],
            strip: vec![],
            add: BTreeMap::from([("x-api-key".to_string(), SealedValue::new("k-123"))]),
        };
        let h = harness(vec![rule]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/users?page=2")
            .header(HOST, "site.example.com")
            .header("x-trace", "t1")
            .header("x-other", "dropped")
            .header(CONTENT_TYPE, "application/json")
            .header(COOKIE, "session=abc")
            .header("x-api-key", "spoofed")
            .body(Bytes::from("{}"))
            .unwrap();
        let response = h.pipeline.handle(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-echo-uri"], "/v1/users?page=2");
        assert_eq!(headers["x-trace"], "t1");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers["x-api-key"], "k-123");
        assert_eq!(headers[HOST], format!("127.0.0.1:{port}"));
        assert!(headers.get("x-other").is_none());
        assert!(headers.get(COOKIE).is_none());
        assert_eq!(response.body(), &Bytes::from("{}"));
        assert!(h.assets.served.lock().is_empty());
    }

    #[tokio::test]
    async fn test_external_proxy_cookies_and_host() {
        let port = start_echo_server().await;
        let mut rule = external("api", "/api/*", port, 0);
        rule.forward_cookies = true;
        rule.preserve_host = true;
        let h = harness(vec![rule]);

        let mut request = get("/api/me");
        request
            .headers_mut()
            .insert(COOKIE, "session=abc".parse().unwrap());
        let response = h.pipeline.handle(request).await.unwrap();

        assert_eq!(response.headers()["x-echo-uri"], "/v1/api/me");
        assert_eq!(response.headers()[COOKIE], "session=abc");
        assert_eq!(response.headers()[HOST], "site.example.com");
    }

    #[tokio::test]
    async fn test_preserve_host_over_http2() {
        let port = start_echo_server().await;
        let mut rule = external("api", "/api/*", port, 0);
        rule.preserve_host = true;
        let h = harness(vec![rule]);

        let request = Request::builder()
            .version(Version::HTTP_2)
            .uri("https://site.example.com/api/me")
            .body(Bytes::new())
            .unwrap();
        assert!(request.headers().get(HOST).is_none());
        let response = h.pipeline.handle(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-echo-uri"], "/v1/api/me");
        assert_eq!(response.headers()[HOST], "site.example.com");
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let port = start_echo_server().await;
        let mut catch_all = RuleRecord::new("all", "/*", ProxyType::InternalRewrite, "/index.html");
        catch_all.order = 0;
        let h = harness(vec![catch_all, external("api", "/api/*", port, 1)]);

        h.pipeline.handle(get("/api/users")).await.unwrap();
        assert_eq!(*h.assets.served.lock(), vec!["/index.html".to_string()]);

        h.store
            .reorder("rs1", &["api".to_string(), "all".to_string()])
            .unwrap();
        let response = h.pipeline.handle(get("/api/users")).await.unwrap();
        assert_eq!(response.headers()["x-echo-uri"], "/v1/api/users");
    }

    #[tokio::test]
    async fn test_internal_rewrite() {
        let mut blog = RuleRecord::new("blog", "/blog/*", ProxyType::InternalRewrite, "/posts");
        blog.strip_prefix = true;
        let docs = RuleRecord::new("docs", "/docs", ProxyType::InternalRewrite, "/documentation/");
        let h = harness(vec![blog, docs]);

        h.pipeline.handle(get("/blog/hello?draft=1")).await.unwrap();
        h.pipeline.handle(get("/blog")).await.unwrap();
        h.pipeline.handle(get("/docs")).await.unwrap();
        h.pipeline.handle(get("/other")).await.unwrap();

        assert_eq!(
            *h.assets.served.lock(),
            vec!["/posts/hello?draft=1", "/blog", "/documentation/", "/other"]
        );
    }

    #[tokio::test]
    async fn test_disabled_rules_and_unknown_hosts() {
        let mut rule = RuleRecord::new("r", "/*", ProxyType::InternalRewrite, "/app.html");
        rule.is_enabled = false;
        let h = harness(vec![rule]);

        h.pipeline.handle(get("/page")).await.unwrap();
        let mut request = get("/page");
        request
            .headers_mut()
            .insert(HOST, "unknown.example.com".parse().unwrap());
        h.store.set_enabled("rs1", "r", true).unwrap();
        h.pipeline.handle(request).await.unwrap();
        h.pipeline.handle(get("/page")).await.unwrap();

        assert_eq!(*h.assets.served.lock(), vec!["/page", "/page", "/app.html"]);
    }

    #[tokio::test]
    async fn test_email_form() {
        let mut rule = RuleRecord::new("contact", "/contact", ProxyType::EmailFormHandler, "");
        rule.email_handler_config = Some(EmailHandlerConfig {
            destination_email: "forms@example.com".into(),
            subject: None,
            success_redirect: None,
            cors_origin: None,
            honeypot_field: None,
            reply_to_field: None,
            require_auth: false,
        });
        let h = harness(vec![rule]);

        let request = Request::builder()
            .method("POST")
            .uri("/contact")
            .header(HOST, "site.example.com")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Bytes::from("name=Ada"))
            .unwrap();
        let response = h.pipeline.handle(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.email.sent.lock()[0].body, "name: Ada\n");
        assert!(h.assets.served.lock().is_empty());
    }

    #[tokio::test]
    async fn test_edge_only_rule() {
        let mut rule = RuleRecord::new(
            "edge",
            "/app/*",
            ProxyType::ExternalProxy,
            "https://api.example.com",
        );
        rule.auth_transform = Some(AuthTransform::CookieToBearer {
            cookie_name: "session".into(),
        });
        let h = harness(vec![rule]);

        let err = h.pipeline.handle(get("/app/data")).await.unwrap_err();
        assert!(matches!(err, ProxyError::EdgeOnlyRule(ref id) if id == "edge"));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    struct CorruptStore;

    #[async_trait::async_trait]
    impl RuleSetProvider for CorruptStore {
        async fn rule_set_for_host(
            &self,
            _host: &str,
        ) -> Result<Option<Arc<ProxyRuleSet>>, StoreError> {
            Err(StoreError::Misconfigured(rules::MisconfiguredRule {
                rule_id: "contact".into(),
                reason: "emailHandlerConfig is required for email_form_handler rules".into(),
            }))
        }
    }

    #[tokio::test]
    async fn test_misconfigured_rule_is_server_error() {
        let pipeline = Pipeline::new(
            Arc::new(CorruptStore),
            Arc::new(RecordingAssets::default()),
            Arc::new(PlaintextSecrets),
            UpstreamClient::new().unwrap(),
            EmailFormHandler::new(
                Arc::new(RecordingEmailService::default()),
                Arc::new(NoSessionAuth),
                Duration::from_secs(1),
            ),
        );

        let err = pipeline.handle(get("/contact")).await.unwrap_err();
        assert!(matches!(err, ProxyError::MisconfiguredRule(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_request_host() {
        let request = Request::builder()
            .uri("https://site.example.com/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request), Some("site.example.com"));
        assert_eq!(request_host(&get("/x")), Some("site.example.com"));
    }
}
