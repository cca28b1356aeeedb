//! Layout URL building
//!
//! A worker joins the session by loading a layout page and capturing it. The
//! page is either one of the standard layouts served by the frontend, a custom
//! layout folder under the custom layout root, or an arbitrary absolute URL.

use crate::config::RecorderConfig;
use crate::recorder::state::{Recording, RecordingLayout};
use crate::utils::error::{RecordingError, RecordingResult};
use std::path::Path;
use std::sync::Arc;
use url::{Position, Url};

/// Route serving folders of the custom layout root
pub const CUSTOM_LAYOUTS_ROUTE: &str = "/layouts/custom";

/// Builds the URL a worker connects to
#[derive(Debug, Clone)]
pub struct LayoutUrlBuilder {
    config: Arc<RecorderConfig>,
}

impl LayoutUrlBuilder {
    pub fn new(config: Arc<RecorderConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, recording: &Recording) -> RecordingResult<String> {
        let properties = &recording.properties;
        let is_custom = properties.recording_layout == RecordingLayout::Custom;

        if is_custom && !properties.custom_layout.is_empty() {
            if let Some(url) = parse_absolute_url(&properties.custom_layout) {
                tracing::info!(
                    "Custom layout of recording {} is a URL ({}), connecting to it directly",
                    recording.id,
                    url
                );
                return self.custom_url_form(&url, &properties.custom_layout, &recording.session_id);
            }
            self.check_custom_layout_path(&properties.custom_layout)?;
        }

        let (scheme, base) = self.normalized_base();
        let basic_auth = if self.config.composed_basic_auth {
            format!("{}:{}@", self.config.layout_auth_user, self.config.secret)
        } else {
            String::new()
        };

        let url = if is_custom {
            let mut layout = properties.custom_layout.clone();
            if !layout.is_empty() {
                if !layout.starts_with('/') {
                    layout.insert(0, '/');
                }
                if layout.ends_with('/') {
                    layout.pop();
                }
            }
            format!(
                "{}://{}{}{}{}/index.html?sessionId={}&secret={}",
                scheme,
                basic_auth,
                base,
                CUSTOM_LAYOUTS_ROUTE,
                layout,
                recording.session_id,
                self.config.secret
            )
        } else {
            let default_path = if self.config.composed_url().is_some() {
                ""
            } else {
                self.config.frontend_default_path.as_str()
            };
            format!(
                "{}://{}{}{}/#/layout-{}/{}/{}/{}/{}",
                scheme,
                basic_auth,
                base,
                default_path,
                properties.recording_layout.kebab_name(),
                recording.session_id,
                self.config.secret,
                self.public_port(scheme),
                !properties.has_audio
            )
        };

        Ok(url)
    }

    /// Composed or public URL without scheme or trailing slash, plus the scheme to use
    fn normalized_base(&self) -> (&'static str, String) {
        let configured = self
            .config
            .composed_url()
            .unwrap_or(self.config.public_url.as_str());

        let without_https = configured.strip_prefix("https://").unwrap_or(configured);
        let (scheme, host) = match without_https.strip_prefix("http://") {
            Some(rest) => ("http", rest),
            None => ("https", without_https),
        };

        (scheme, host.strip_suffix('/').unwrap_or(host).to_string())
    }

    fn public_port(&self, scheme: &str) -> u16 {
        Url::parse(&self.config.public_url)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(if scheme == "http" { 80 } else { 443 })
    }

    fn check_custom_layout_path(&self, layout: &str) -> RecordingResult<()> {
        let root = &self.config.custom_layout_path;
        let layout_dir = root.join(layout.trim_start_matches('/'));
        let index_html = layout_dir.join("index.html");

        tracing::info!(
            "Custom layout \"{}\" requested. Expected path: {:?}",
            layout,
            index_html
        );

        let not_valid = || {
            let error = format!(
                "Custom layout path {} is not valid. Expected file {:?} to exist and be readable",
                layout, index_html
            );
            tracing::error!("{}", error);
            RecordingError::PathNotValid(error)
        };

        if !index_html.is_file() || !is_within(root, &layout_dir) {
            return Err(not_valid());
        }

        tracing::info!("Custom layout path \"{}\" is valid", layout);
        Ok(())
    }

    fn custom_url_form(&self, url: &Url, raw: &str, session_id: &str) -> RecordingResult<String> {
        let mut final_url = url[..Position::AfterPath].to_string();
        if final_url.ends_with('/') {
            final_url.pop();
        }

        if let Some(query) = raw_query(raw) {
            if !is_valid_query(query) {
                let error = format!(
                    "Custom layout has URL format and query params ({}), but the query does not comply with URI syntax",
                    raw
                );
                tracing::error!("{}", error);
                return Err(RecordingError::PathNotValid(error));
            }

            let mut params: Vec<String> = query
                .split('&')
                .filter(|param| !param.is_empty())
                .map(str::to_string)
                .collect();

            let has_param = |params: &[String], key: &str| {
                params
                    .iter()
                    .any(|param| param.split('=').next() == Some(key))
            };

            if !has_param(&params, "sessionId") {
                params.push(format!("sessionId={}", urlencoding::encode(session_id)));
            }
            if !has_param(&params, "secret") {
                params.push(format!("secret={}", urlencoding::encode(&self.config.secret)));
            }

            final_url.push('?');
            final_url.push_str(&params.join("&"));
        }

        if let Some(fragment) = url.fragment() {
            final_url.push('#');
            final_url.push_str(fragment);
        }

        Ok(final_url)
    }
}

/// Absolute http(s) URL, or `None` for a path under the custom layout root
fn parse_absolute_url(value: &str) -> Option<Url> {
    Url::parse(value)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

/// Query exactly as written, between `?` and `#`
fn raw_query(raw: &str) -> Option<&str> {
    let without_fragment = raw.split('#').next().unwrap_or(raw);
    without_fragment.split_once('?').map(|(_, query)| query)
}

/// RFC 3986 query grammar: pchar / "/" / "?"
fn is_valid_query(query: &str) -> bool {
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%' {
            if i + 2 >= bytes.len() {
                return false;
            }
            if !(bytes[i + 1].is_ascii_hexdigit() && bytes[i + 2].is_ascii_hexdigit()) {
                return false;
            }
            i += 3;
            continue;
        }
        let allowed = c.is_ascii_alphanumeric()
            || b"-._~!$&'()*+,;=:@/?".contains(&c);
        if !allowed {
            return false;
        }
        i += 1;
    }
    true
}

fn is_within(root: &Path, dir: &Path) -> bool {
    match (root.canonicalize(), dir.canonicalize()) {
        (Ok(root), Ok(dir)) => dir.starts_with(root),
        _ => false,
    }
}
