use thiserror::Error;
use url::Url;

/// Errors that can occur while canonicalizing a link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link string could not be parsed.
    #[error("Invalid link: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The link uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The link has no host component.
    #[error("Link has no host")]
    MissingHost,
}

/// Query parameters that vary per share/visit and never identify content.
const VOLATILE_PARAMS: &[&str] = &[
    "scene",
    "sessionid",
    "subscene",
    "clicktime",
    "enterid",
    "ascene",
    "devicetype",
    "version",
    "nettype",
    "lang",
    "exportkey",
    "pass_ticket",
    "wx_header",
];

/// Returns the canonical form of a snapshot, asset or side-channel URL.
///
/// - only `http` / `https` URLs with a host are accepted
/// - scheme and host are lowercased, default ports dropped (done by [`Url`])
/// - the fragment is removed
///
/// The query is kept as-is: for generic resources it is part of what
/// identifies the content (`app.css?version=2`).
///
/// # Examples
///
/// ```
/// use feedvault::util::canonical_url;
///
/// let url = canonical_url("HTTPS://CDN.example.com:443/app.css?version=2#top").unwrap();
/// assert_eq!(url, "https://cdn.example.com/app.css?version=2");
///
/// assert!(canonical_url("file:///etc/passwd").is_err());
/// ```
pub fn canonical_url(raw: &str) -> Result<String, LinkError> {
    parse_web_url(raw).map(String::from)
}

/// Returns the canonical form of an article link.
///
/// Same as [`canonical_url`], and additionally drops the share/visit
/// parameters in `VOLATILE_PARAMS` (remaining parameters keep their order;
/// an empty query is removed). A link captured by the crawler and the same
/// article shared with `scene=…` appended resolve to the same record.
///
/// ```
/// use feedvault::util::canonical_article_link;
///
/// let link = canonical_article_link("https://Example.com/s/abc?scene=27#rd").unwrap();
/// assert_eq!(link, "https://example.com/s/abc");
/// ```
pub fn canonical_article_link(raw: &str) -> Result<String, LinkError> {
    let mut url = parse_web_url(raw)?;

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !VOLATILE_PARAMS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    Ok(url.into())
}

fn parse_web_url(raw: &str) -> Result<Url, LinkError> {
    let mut url = Url::parse(raw.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(LinkError::UnsupportedScheme(scheme.to_owned())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(LinkError::MissingHost);
    }

    url.set_fragment(None);
    Ok(url)
}
