use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// 代理决策
#[derive(Debug, PartialEq, Eq)]
enum ProxyChoice {
    Via(String),
    /// provider 显式设置 proxy = ""，或目标命中 no_proxy
    Direct,
    /// 未配置，交给 reqwest 读取 HTTPS_PROXY / HTTP_PROXY
    Environment,
}

/// Host part of a URL, without scheme, credentials or port.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = if let Some(v6) = host_port.strip_prefix('[') {
        v6.split(']').next()?
    } else {
        host_port.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// `localhost` 精确匹配；`*.corp` 只匹配子域名；`.corp` 同时匹配自身和子域名
fn bypasses_proxy(host: &str, rules: &[String]) -> bool {
    rules.iter().any(|rule| {
        let rule = rule.trim().to_lowercase();
        if rule.is_empty() {
            false
        } else if let Some(domain) = rule.strip_prefix("*.") {
            host.ends_with(&format!(".{}", domain))
        } else if let Some(domain) = rule.strip_prefix('.') {
            host == domain || host.ends_with(&format!(".{}", domain))
        } else {
            host == rule
        }
    })
}

fn choose_proxy(
    provider_proxy: Option<&str>,
    global_proxy: Option<&str>,
    no_proxy: &[String],
    api_base: &str,
) -> ProxyChoice {
    match provider_proxy {
        Some("") => return ProxyChoice::Direct,
        Some(p) => return ProxyChoice::Via(p.to_string()),
        None => {}
    }

    match global_proxy {
        Some(global) if !global.is_empty() => {
            let bypass = host_of(api_base)
                .map(|h| bypasses_proxy(&h, no_proxy))
                .unwrap_or(false);
            if bypass {
                ProxyChoice::Direct
            } else {
                ProxyChoice::Via(global.to_string())
            }
        }
        _ => ProxyChoice::Environment,
    }
}

/// HTTP client for one provider endpoint, honouring provider, global and no_proxy settings.
pub fn build_http_client(
    provider_proxy: Option<&str>,
    global_proxy: Option<&str>,
    no_proxy: &[String],
    api_base: &str,
    timeout: Duration,
) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match choose_proxy(provider_proxy, global_proxy, no_proxy, api_base) {
        ProxyChoice::Via(url) => match Proxy::all(&url) {
            Ok(proxy) => {
                info!(proxy = %url, api_base = %api_base, "🌐 [http] using proxy");
                builder = builder.proxy(proxy);
            }
            Err(e) => {
                warn!(error = %e, proxy = %url, "🌐 [http] invalid proxy URL, connecting directly");
            }
        },
        ProxyChoice::Direct => {
            builder = builder.no_proxy();
        }
        ProxyChoice::Environment => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "🌐 [http] client build failed, using defaults");
        Client::new()
    })
}
