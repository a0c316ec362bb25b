//! Streaming HTTP download of the archive.

use std::io::Read;

use tracing::{debug, info};

use crate::error::{UnpackError, UnpackResult};

/// Resolve the proxy URI from environment variables.
///
/// Checks (in order): `https_proxy`, `HTTPS_PROXY`, `http_proxy`, `HTTP_PROXY`,
/// `all_proxy`, `ALL_PROXY`. Returns the first non-empty value found.
fn proxy_from_env() -> Option<String> {
    first_env(&[
        "https_proxy",
        "HTTPS_PROXY",
        "http_proxy",
        "HTTP_PROXY",
        "all_proxy",
        "ALL_PROXY",
    ])
}

fn first_env(vars: &[&str]) -> Option<String> {
    vars.iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|val| !val.is_empty())
}

/// Whether `host` should be fetched directly instead of through the proxy.
///
/// Loopback hosts always bypass. `no_proxy` is a comma-separated list of host
/// names or domain suffixes (a leading dot is optional); `*` matches all.
fn bypass_proxy(host: &str, no_proxy: Option<&str>) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    no_proxy.is_some_and(|list| {
        list.split(',')
            .map(|entry| entry.trim().trim_start_matches('.'))
            .filter(|entry| !entry.is_empty())
            .any(|entry| {
                entry == "*"
                    || host.eq_ignore_ascii_case(entry)
                    || host
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", entry.to_ascii_lowercase()))
            })
    })
}

fn build_http_agent(url: &str) -> UnpackResult<ureq::Agent> {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    let mut config = ureq::Agent::config_builder();
    let no_proxy = first_env(&["no_proxy", "NO_PROXY"]);
    if bypass_proxy(&host, no_proxy.as_deref()) {
        config = config.proxy(None);
    } else if let Some(proxy_uri) = proxy_from_env() {
        debug!(proxy = %proxy_uri, "using proxy");
        let proxy = ureq::Proxy::new(&proxy_uri).map_err(|err| UnpackError::DownloadFailed {
            url: url.to_string(),
            source: Box::new(err),
        })?;
        config = config.proxy(Some(proxy));
    }
    Ok(config.build().into())
}

/// Issue the GET request and hand back the unread response body.
///
/// Transport errors and non-success statuses both fail; nothing is retried
/// and no timeout is applied.
pub fn open(url: &str) -> UnpackResult<Box<dyn Read>> {
    let agent = build_http_agent(url)?;
    let response = agent
        .get(url)
        .call()
        .map_err(|err| UnpackError::DownloadFailed {
            url: url.to_string(),
            source: Box::new(err),
        })?;

    let content_length = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    info!(
        url,
        status = response.status().as_u16(),
        content_type = response.body().mime_type().unwrap_or("unknown"),
        content_length,
        "downloading archive"
    );

    Ok(Box::new(response.into_body().into_reader()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_proxy() {
        assert!(bypass_proxy("localhost", None));
        assert!(bypass_proxy("127.0.0.1", None));
        assert!(bypass_proxy("[::1]", None));
        assert!(!bypass_proxy("example.com", None));
        assert!(bypass_proxy("example.com", Some("*")));
        assert!(bypass_proxy("files.example.com", Some("internal, .example.com")));
        assert!(bypass_proxy("Example.com", Some("example.com")));
        assert!(!bypass_proxy("notexample.com", Some("example.com")));
        assert!(!bypass_proxy("example.org", Some("example.com,,")));
    }

    #[test]
    fn test_connection_refused_is_download_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/archive.tgz");
        let err = match open(&url) {
            Ok(_) => panic!("expected a download failure"),
            Err(err) => err,
        };
        assert!(matches!(err, UnpackError::DownloadFailed { .. }));
        assert_eq!(err.exit_code(), 5);
    }
}
