//! Request interception on the proxied fetch pipeline.
//!
//! Two hooks: one records the anti-automation challenge request ChatGPT
//! makes so it can be replayed later, the other makes Bing requests look like
//! they come from bing.com itself.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::config::ConfigStore;

pub const BING_ORIGIN: &str = "https://www.bing.com";
pub const BING_REFERER: &str = "https://www.bing.com/search?q=Bing+AI&showconv=1&FORM=hpcodx";

/// Body of an outgoing request, as the browser reports it
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    pub form_data: BTreeMap<String, Vec<String>>,
    pub raw: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct RequestDetails {
    pub url: String,
    pub body: Option<RequestBody>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArkoseCapture {
    pub url: String,
    pub form: String,
}

fn host_of(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    Some((scheme, host))
}

fn matches_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn is_chatgpt_request(url: &str) -> bool {
    matches!(host_of(url), Some(("https", host))
        if matches_domain(host, "openai.com") || matches_domain(host, "chatgpt.com"))
}

pub fn is_bing_request(url: &str) -> bool {
    matches!(
        host_of(url),
        Some(("https", "www.bing.com")) | Some(("wss", "sydney.bing.com"))
    )
}

fn encode_form(form: &BTreeMap<String, Vec<String>>) -> String {
    form.iter()
        .flat_map(|(key, values)| values.iter().map(move |value| (key, value)))
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key).replace("%20", "+"),
                urlencoding::encode(value).replace("%20", "+")
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Recognize a `/public_key` challenge request worth remembering.
///
/// Requests already carrying `default_params` are our own replays and are
/// ignored.
pub fn capture_arkose(details: &RequestDetails, default_params: &str) -> Option<ArkoseCapture> {
    if !is_chatgpt_request(&details.url)
        || !details.url.contains("/public_key")
        || (!default_params.is_empty() && details.url.contains(default_params))
    {
        return None;
    }
    let form = match &details.body {
        Some(body) => {
            let encoded = encode_form(&body.form_data);
            if encoded.is_empty() {
                body.raw
                    .first()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default()
            } else {
                encoded
            }
        }
        None => String::new(),
    };
    Some(ArkoseCapture {
        url: details.url.clone(),
        form,
    })
}

/// Point `Origin` and `Referer` at bing.com. Only headers already present are
/// touched; returns whether anything changed.
pub fn rewrite_bing_headers(url: &str, headers: &mut BTreeMap<String, String>) -> bool {
    if !is_bing_request(url) {
        return false;
    }
    let mut modified = false;
    for (name, value) in headers.iter_mut() {
        let replacement = match name.to_ascii_lowercase().as_str() {
            "origin" => BING_ORIGIN,
            "referer" => BING_REFERER,
            _ => continue,
        };
        *value = replacement.to_string();
        modified = true;
    }
    modified
}

/// Applies both hooks to requests leaving through the host
#[derive(Clone)]
pub struct Interceptor {
    config: ConfigStore,
}

impl Interceptor {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    /// Returns the capture when one was stored.
    pub async fn before_request(&self, details: &RequestDetails) -> Option<ArkoseCapture> {
        let params = self.config.get().chatgpt_arkose_req_params.clone();
        let capture = capture_arkose(details, &params)?;
        info!(
            component = "intercept",
            event = "intercept.arkose.captured",
            url = %capture.url,
            "Capturing Arkose public_key request"
        );
        let stored = capture.clone();
        match self
            .config
            .update(move |c| {
                c.chatgpt_arkose_req_url = stored.url;
                c.chatgpt_arkose_req_form = stored.form;
            })
            .await
        {
            Ok(_) => Some(capture),
            Err(e) => {
                error!(
                    component = "intercept",
                    event = "intercept.arkose.save_failed",
                    error = %e,
                    "Error saving Arkose req url and form"
                );
                None
            }
        }
    }

    pub fn before_send_headers(&self, url: &str, headers: &mut BTreeMap<String, String>) -> bool {
        let modified = rewrite_bing_headers(url, headers);
        if modified {
            debug!(
                component = "intercept",
                event = "intercept.bing.headers_rewritten",
                url = %url,
                "Modified headers for Bing"
            );
        }
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UserConfig, DEFAULT_ARKOSE_REQ_PARAMS};

    fn details(url: &str, body: Option<RequestBody>) -> RequestDetails {
        RequestDetails {
            url: url.to_string(),
            body,
        }
    }

    #[test]
    fn captures_public_key_requests_with_form_data() {
        let mut form = BTreeMap::new();
        form.insert("public_key".to_string(), vec!["35536E1E".to_string()]);
        form.insert("site".to_string(), vec!["https://chatgpt.com".to_string()]);
        let capture = capture_arkose(
            &details(
                "https://tcr9i.chat.openai.com/fc/gt2/public_key/35536E1E",
                Some(RequestBody {
                    form_data: form,
                    raw: Vec::new(),
                }),
            ),
            DEFAULT_ARKOSE_REQ_PARAMS,
        )
        .expect("captured");
        assert_eq!(capture.form, "public_key=35536E1E&site=https%3A%2F%2Fchatgpt.com");
    }

    #[test]
    fn falls_back_to_the_raw_body() {
        let capture = capture_arkose(
            &details(
                "https://chatgpt.com/fc/gt2/public_key/X",
                Some(RequestBody {
                    form_data: BTreeMap::new(),
                    raw: vec![Bytes::from_static(b"bda=abc&rnd=0.5")],
                }),
            ),
            DEFAULT_ARKOSE_REQ_PARAMS,
        )
        .unwrap();
        assert_eq!(capture.form, "bda=abc&rnd=0.5");
    }

    #[test]
    fn ignores_replays_and_other_hosts() {
        assert!(capture_arkose(
            &details("https://chatgpt.com/fc/gt2/public_key/X?cgb=vhwi", None),
            DEFAULT_ARKOSE_REQ_PARAMS
        )
        .is_none());
        assert!(capture_arkose(
            &details("https://evil-openai.com/public_key", None),
            DEFAULT_ARKOSE_REQ_PARAMS
        )
        .is_none());
        assert!(capture_arkose(
            &details("https://chatgpt.com/backend-api/conversation", None),
            DEFAULT_ARKOSE_REQ_PARAMS
        )
        .is_none());
    }

    #[test]
    fn rewrites_only_present_bing_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("Origin".to_string(), "chrome-extension://abc".to_string());
        headers.insert("Accept".to_string(), "*/*".to_string());

        assert!(rewrite_bing_headers(
            "https://www.bing.com/turing/conversation/create",
            &mut headers
        ));
        assert_eq!(headers["Origin"], BING_ORIGIN);
        assert!(!headers.contains_key("Referer"));
        assert_eq!(headers["Accept"], "*/*");

        let mut other = headers.clone();
        other.insert("referer".to_string(), "x".to_string());
        assert!(!rewrite_bing_headers("https://example.com/", &mut other));
        assert_eq!(other["referer"], "x");

        let mut ws = BTreeMap::from([("referer".to_string(), "x".to_string())]);
        assert!(rewrite_bing_headers("wss://sydney.bing.com/sydney/ChatHub", &mut ws));
        assert_eq!(ws["referer"], BING_REFERER);
    }

    #[tokio::test]
    async fn interceptor_persists_captures() {
        let config = ConfigStore::in_memory(UserConfig::default());
        let interceptor = Interceptor::new(config.clone());
        let captured = interceptor
            .before_request(&details("https://chat.openai.com/public_key/ABC", None))
            .await;
        assert!(captured.is_some());
        assert_eq!(
            config.get().chatgpt_arkose_req_url,
            "https://chat.openai.com/public_key/ABC"
        );
        assert_eq!(config.get().chatgpt_arkose_req_form, "");
    }
}
