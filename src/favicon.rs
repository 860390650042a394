use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;
use url::Url;

use crate::outcome::{Outcome, SkipReason};
use crate::transport::Transport;

/// A downloaded site icon, ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favicon {
    pub url: String,
    /// Icon bytes, base64 encoded
    pub content: String,
}

/// Finds a site icon: `/favicon.ico` at the site root first, then whatever
/// the page declares with `<link rel="icon">` or `<link rel="shortcut icon">`.
#[derive(Clone)]
pub struct FaviconResolver {
    transport: Transport,
}

impl FaviconResolver {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Resolves using the site link, retrying with the feed's own URL when
    /// the site link is missing or cannot be parsed.
    pub async fn resolve_for(&self, site_url: Option<&str>, feed_url: &str) -> Outcome<Favicon> {
        if let Some(site_url) = site_url {
            match self.resolve(site_url).await {
                Outcome::Skipped(SkipReason::InvalidUrl(_)) => {
                    debug!(site_url, feed_url, "Site link unusable, trying feed URL for favicon");
                }
                outcome => return outcome,
            }
        }
        self.resolve(feed_url).await
    }

    pub async fn resolve(&self, candidate: &str) -> Outcome<Favicon> {
        let page = match parse_site_url(candidate) {
            Some(page) => page,
            None => return Outcome::Skipped(SkipReason::InvalidUrl(candidate.to_string())),
        };

        if let Ok(direct) = page.join("/favicon.ico") {
            match self.download(direct.as_str()).await {
                Outcome::Ok(favicon) => return Outcome::Ok(favicon),
                Outcome::Skipped(reason) => {
                    debug!(url = %direct, %reason, "No favicon at site root, reading page");
                }
            }
        }

        let fetched = match self.transport.get(page.as_str()).await {
            Ok(fetched) => fetched,
            Err(e) => return Outcome::Skipped(e.into()),
        };
        let html = String::from_utf8_lossy(&fetched.body);

        let icon_url = match find_icon_href(&html).and_then(|href| page.join(&href).ok()) {
            Some(icon_url) => icon_url,
            None => return Outcome::Skipped(SkipReason::NoIconLink),
        };

        self.download(icon_url.as_str()).await
    }

    /// Downloads a known icon URL.
    pub async fn download(&self, url: &str) -> Outcome<Favicon> {
        let fetched = match self.transport.get(url).await {
            Ok(fetched) => fetched,
            Err(e) => return Outcome::Skipped(e.into()),
        };

        if fetched.body.is_empty() {
            return Outcome::Skipped(SkipReason::EmptyBody);
        }
        if fetched.is_html() {
            return Outcome::Skipped(SkipReason::NotAnIcon(
                fetched.content_type.unwrap_or_default(),
            ));
        }

        Outcome::Ok(Favicon {
            url: url.to_string(),
            content: STANDARD.encode(&fetched.body),
        })
    }
}

fn parse_site_url(candidate: &str) -> Option<Url> {
    let url = Url::parse(candidate.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url)
}

/// Returns the `href` of the first `<link>` whose `rel` is `icon` or
/// `shortcut icon`.
pub fn find_icon_href(html: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`
    let lower = html.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(found) = lower[search_from..].find("<link") {
        let start = search_from + found;
        let after_name = start + "<link".len();

        let end = match lower[start..].find('>') {
            Some(pos) => start + pos,
            None => return None,
        };
        search_from = end + 1;

        // `<linkfoo>` is a different element
        if !lower[after_name..]
            .starts_with(|c: char| c.is_ascii_whitespace() || c == '/' || c == '>')
        {
            continue;
        }

        let attrs = parse_attributes(&html[after_name..end]);
        let is_icon = attrs.iter().any(|(name, value)| {
            name == "rel" && {
                let rel = value.trim().to_ascii_lowercase();
                rel == "icon" || rel == "shortcut icon"
            }
        });
        if !is_icon {
            continue;
        }

        if let Some((_, href)) = attrs.into_iter().find(|(name, _)| name == "href") {
            let href = href.trim().to_string();
            if !href.is_empty() {
                return Some(href);
            }
        }
    }

    None
}

/// Splits the inside of a tag into `(lowercased name, value)` pairs.
/// Handles double, single and unquoted values.
fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    let bytes = raw.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' && bytes[i] != b'/' {
            i += 1;
        }
        if name_start == i {
            break;
        }
        let name = raw[name_start..i].to_ascii_lowercase();

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            attrs.push((name, String::new()));
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let value = match bytes.get(i) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                let value_start = i + 1;
                let value_end = raw[value_start..]
                    .find(quote as char)
                    .map(|pos| value_start + pos)
                    .unwrap_or(bytes.len());
                i = (value_end + 1).min(bytes.len());
                &raw[value_start..value_end]
            }
            _ => {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                &raw[value_start..i]
            }
        };
        attrs.push((name, value.to_string()));
    }

    attrs
}
