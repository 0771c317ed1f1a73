use proxy::config::Config as ProxyConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub proxy: Option<ProxyConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy::config::StaticAssetsConfig;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn proxy_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://public@sentry.example.com/1
            proxy:
                listener:
                    host: 0.0.0.0
                    port: 3000
                admin_listener:
                    host: 127.0.0.1
                    port: 3001
                static_assets:
                    type: upstream
                    url: http://assets.default.svc
                hosts:
                    site.example.com: rs1
                rule_sets:
                    - id: rs1
                      projectId: p1
                      name: main
                      rules:
                          - id: api
                            pathPattern: /api/*
                            targetUrl: https://api.example.com
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.common.metrics.expect("metrics").statsd_port, 8125);
        assert!(config.common.logging.is_some());

        let proxy = config.proxy.expect("proxy config");
        proxy.validate().expect("valid proxy config");
        assert_eq!(proxy.listener.port, 3000);
        assert!(matches!(
            proxy.static_assets,
            StaticAssetsConfig::Upstream { .. }
        ));
        assert_eq!(proxy.rule_sets[0].rules[0].id, "api");
    }

    #[test]
    fn missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/sitegate.yaml"));
        assert!(matches!(err, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn bad_yaml() {
        let tmp = write_tmp_file("proxy: [not, a, map]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
