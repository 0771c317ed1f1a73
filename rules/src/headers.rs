// Computes the header set sent to an external upstream. Nothing is copied from the
// inbound request unless the rule asks for it.

use crate::model::HeaderConfig;
use http::header::{COOKIE, HOST, HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

/// A plaintext header value handed over by the secret store for one request.
pub type RevealedHeader = (String, SecretString);

/// Builds the outbound headers for an external proxy rule.
///
/// The sealed values in `config.add` are ignored here; `added` carries their
/// plaintext, already revealed by the secret store. Those values are never logged.
///
/// Steps, in order:
/// 1. start from an empty set
/// 2. copy `Cookie` when `forward_cookies` is set or it is listed in `forward`
/// 3. copy every header listed in `forward`
/// 4. remove every header listed in `strip`
/// 5. set every header in `added`, overwriting
/// 6. set `Host` to `target_host`, or to `original_host` with `preserve_host`
///
/// `original_host` is the host the client asked for. HTTP/2 clients send it as the
/// `:authority` pseudo-header rather than a `Host` header, so callers resolve it
/// from the request URI when the header is absent.
pub fn compute_headers(
    inbound: &HeaderMap,
    config: &HeaderConfig,
    added: &[RevealedHeader],
    forward_cookies: bool,
    preserve_host: bool,
    original_host: Option<&str>,
    target_host: &str,
) -> HeaderMap {
    let mut outbound = HeaderMap::new();

    if forward_cookies {
        copy_header(inbound, &mut outbound, &COOKIE);
    }

    for name in parse_names(&config.forward) {
        copy_header(inbound, &mut outbound, &name);
    }

    for name in parse_names(&config.strip) {
        outbound.remove(&name);
    }

    for (name, value) in added {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "Skipping added header with invalid name");
            continue;
        };
        match HeaderValue::from_str(value.expose_secret()) {
            Ok(mut header_value) => {
                header_value.set_sensitive(true);
                outbound.insert(header_name, header_value);
            }
            Err(_) => {
                tracing::warn!(header = %name, "Skipping added header with invalid value");
            }
        }
    }

    let host = match preserve_host {
        true => original_host.and_then(|host| HeaderValue::from_str(host).ok()),
        false => HeaderValue::from_str(target_host).ok(),
    };
    match host {
        Some(host) => {
            outbound.insert(HOST, host);
        }
        None => {
            outbound.remove(HOST);
        }
    }

    outbound
}

fn parse_names(names: &[String]) -> impl Iterator<Item = HeaderName> + '_ {
    names
        .iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
}

// Replaces any values already copied so a header listed twice is not duplicated.
fn copy_header(inbound: &HeaderMap, outbound: &mut HeaderMap, name: &HeaderName) {
    let mut values = inbound.get_all(name).iter();
    let Some(first) = values.next() else {
        return;
    };
    outbound.insert(name.clone(), first.clone());
    for value in values {
        outbound.append(name.clone(), value.clone());
    }
}
