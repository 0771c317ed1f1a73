// Turns sealed `headerConfig.add` values into plaintext for the request being served.
// Keys and decryption stay behind the `SecretStore` trait; the pipeline only ever
// sees the revealed values, wrapped so they cannot end up in logs.

use async_trait::async_trait;
use rules::{HeaderConfig, RevealedHeader, SealedValue};
use secrecy::SecretString;

const ENV_PREFIX: &str = "env:";

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("sealed value for header {0} has an unsupported format")]
    UnsupportedFormat(String),
    #[error("secret for header {header} is not available in {variable}")]
    MissingVariable { header: String, variable: String },
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn reveal(&self, header: &str, sealed: &SealedValue)
    -> Result<SecretString, SecretError>;
}

/// Reveals every value of `config.add`, keeping the header names alongside.
pub async fn reveal_headers(
    store: &dyn SecretStore,
    config: &HeaderConfig,
) -> Result<Vec<RevealedHeader>, SecretError> {
    let mut revealed = Vec::with_capacity(config.add.len());
    for (name, sealed) in &config.add {
        revealed.push((name.clone(), store.reveal(name, sealed).await?));
    }
    Ok(revealed)
}

/// Resolves sealed values of the form `env:VARIABLE` from the process environment.
pub struct EnvSecrets;

#[async_trait]
impl SecretStore for EnvSecrets {
    async fn reveal(
        &self,
        header: &str,
        sealed: &SealedValue,
    ) -> Result<SecretString, SecretError> {
        let variable = sealed
            .as_sealed_str()
            .strip_prefix(ENV_PREFIX)
            .ok_or_else(|| SecretError::UnsupportedFormat(header.to_string()))?;

        std::env::var(variable)
            .map(SecretString::from)
            .map_err(|_| SecretError::MissingVariable {
                header: header.to_string(),
                variable: variable.to_string(),
            })
    }
}

/// Development store: sealed values are stored as plaintext.
pub struct PlaintextSecrets;

#[async_trait]
impl SecretStore for PlaintextSecrets {
    async fn reveal(
        &self,
        _header: &str,
        sealed: &SealedValue,
    ) -> Result<SecretString, SecretError> {
        Ok(SecretString::from(sealed.as_sealed_str().to_string()))
    }
}
