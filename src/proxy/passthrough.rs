//! Traffic that is relayed without capture

use regex::Regex;
use url::Url;

use crate::app::ProxyConfig;

/// Browser background traffic that would only clutter a capture.
const STATIC_PREFIXES: &[&str] = &[
    "https://accounts.google.com:443/ListAccounts?gpsia=1&source=ChromiumBrowser",
    "https://update.googleapis.com:443/service/update2/json",
    "http://edgedl.me.gvt1.com:80/edgedl/release2/chrome_component/",
    "http://edgedl.me.gvt1.com/edgedl/release2/chrome_component/",
    "https://www.google.com:443/complete/search?client=chrome-omni",
    "https://optimizationguide-pa.googleapis.com:443/v1:GetModels",
];

/// Passthrough rules: static prefixes, excluded domains and URL patterns.
#[derive(Debug, Default)]
pub struct Passthrough {
    exclude_domains: Vec<String>,
    patterns: Vec<Regex>,
}

impl Passthrough {
    pub fn new(exclude_domains: Vec<String>, patterns: Vec<Regex>) -> Self {
        Self {
            exclude_domains: exclude_domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            patterns,
        }
    }

    /// Build from config; invalid patterns are skipped with a warning.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let patterns = config
            .passthrough_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, "Ignoring invalid passthrough pattern: {}", e);
                    None
                }
            })
            .collect();
        Self::new(config.exclude_domains.clone(), patterns)
    }

    /// Whether a CONNECT to `host` should be tunnelled blind.
    pub fn host_excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.exclude_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }

    /// Whether the exchange for `url` should bypass capture.
    pub fn matches(&self, url: &Url) -> bool {
        if url.host_str().is_some_and(|h| self.host_excluded(h)) {
            return true;
        }

        let forms = url_forms(url);
        if forms
            .iter()
            .any(|form| STATIC_PREFIXES.iter().any(|p| form.starts_with(p)))
        {
            return true;
        }
        forms
            .iter()
            .any(|form| self.patterns.iter().any(|re| re.is_match(form)))
    }
}

/// The URL both with and without an explicit port.
fn url_forms(url: &Url) -> [String; 2] {
    let bare = url.as_str().to_string();
    let Some(host) = url.host_str() else {
        return [bare.clone(), bare];
    };
    let port = url.port_or_known_default().unwrap_or_default();

    let mut rest = url.path().to_string();
    if let Some(query) = url.query() {
        rest.push('?');
        rest.push_str(query);
    }
    let with_port = format!("{}://{}:{}{}", url.scheme(), host, port, rest);
    [with_port, bare]
}
