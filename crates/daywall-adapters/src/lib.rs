//! Listing-page adapter: resolves the current item's download URL.

use daywall_core::PipelineError;
use daywall_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "daywall-adapters";

pub const DEFAULT_LISTING_URL: &str = "https://wallscloud.net/ru/wallpapers/random";
/// CSS form of `//*[@id="main"]/div[4]/div[2]/figure[1]/div/a`.
pub const DEFAULT_LINK_SELECTOR: &str =
    "#main > div:nth-of-type(4) > div:nth-of-type(2) > figure:nth-of-type(1) > div > a";
pub const DEFAULT_IMAGE_SUFFIX: &str = "/1600x900/download";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid listing url {url}: {reason}")]
    InvalidListingUrl { url: String, reason: String },
    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("selector {selector} matched nothing")]
    NoMatch { selector: String },
    #[error("node matched by {selector} has no href or data-href")]
    MissingLink { selector: String },
}

impl From<ResolveError> for PipelineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Fetch(_) | ResolveError::InvalidListingUrl { .. } => {
                PipelineError::Fetch(err.to_string())
            }
            ResolveError::InvalidSelector { .. }
            | ResolveError::NoMatch { .. }
            | ResolveError::MissingLink { .. } => PipelineError::Extraction(err.to_string()),
        }
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First node matching `selector`; its `href`, else its `data-href`.
pub fn extract_link(html: &str, selector: &str) -> Result<String, ResolveError> {
    let sel = Selector::parse(selector).map_err(|e| ResolveError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })?;
    let document = Html::parse_document(html);
    let node = document
        .select(&sel)
        .next()
        .ok_or_else(|| ResolveError::NoMatch {
            selector: selector.to_string(),
        })?;

    let element = node.value();
    element
        .attr("href")
        .and_then(text_or_none)
        .or_else(|| element.attr("data-href").and_then(text_or_none))
        .ok_or_else(|| ResolveError::MissingLink {
            selector: selector.to_string(),
        })
}

fn is_absolute(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Make `reference` absolute against the origin of `listing_url`.
pub fn absolutize(listing_url: &str, reference: &str) -> Result<String, ResolveError> {
    if is_absolute(reference) {
        return Ok(reference.to_string());
    }

    let base = Url::parse(listing_url).map_err(|e| ResolveError::InvalidListingUrl {
        url: listing_url.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(rest) = reference.strip_prefix("//") {
        return Ok(format!("{}://{}", base.scheme(), rest));
    }

    let origin = base.origin();
    if !origin.is_tuple() {
        return Err(ResolveError::InvalidListingUrl {
            url: listing_url.to_string(),
            reason: "url has no host".to_string(),
        });
    }
    let origin = origin.ascii_serialization();
    Ok(format!(
        "{}/{}",
        origin.trim_end_matches('/'),
        reference.trim_start_matches('/')
    ))
}

/// Join `suffix` onto `resolved` with exactly one separator.
pub fn append_suffix(resolved: &str, suffix: &str) -> String {
    let base = resolved.trim_end_matches('/');
    let tail = suffix.trim_start_matches('/');
    if tail.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{tail}")
    }
}

#[derive(Debug, Clone)]
pub struct SourceResolver {
    listing_url: String,
    selector: String,
    image_suffix: String,
}

impl SourceResolver {
    pub fn new(
        listing_url: impl Into<String>,
        selector: impl Into<String>,
        image_suffix: impl Into<String>,
    ) -> Self {
        Self {
            listing_url: listing_url.into(),
            selector: selector.into(),
            image_suffix: image_suffix.into(),
        }
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    pub async fn resolve_download_url(&self, http: &HttpFetcher) -> Result<String, ResolveError> {
        let page = http.fetch_bytes(&self.listing_url).await?;
        let html = String::from_utf8_lossy(&page.body);
        let reference = extract_link(&html, &self.selector)?;
        debug!(%reference, "extracted listing link");

        let resolved = absolutize(&self.listing_url, &reference)?;
        let download_url = append_suffix(&resolved, &self.image_suffix);
        info!(%download_url, "resolved download url");
        Ok(download_url)
    }
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::new(DEFAULT_LISTING_URL, DEFAULT_LINK_SELECTOR, DEFAULT_IMAGE_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daywall_storage::HttpClientConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WALLSCLOUD_LIKE: &str = r#"
        <html><body><div id="main">
          <div>nav</div><div>crumbs</div><div>ads</div>
          <div>
            <div class="sidebar"></div>
            <div class="grid">
              <figure><div><a href="/ru/wallpapers/mountain-lake-12345/">Mountain</a></div></figure>
              <figure><div><a href="/ru/wallpapers/other-1/">Other</a></div></figure>
            </div>
          </div>
        </div></body></html>
    "#;

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("client")
    }

    #[test]
    fn default_selector_follows_structural_path() {
        let link = extract_link(WALLSCLOUD_LIKE, DEFAULT_LINK_SELECTOR).unwrap();
        assert_eq!(link, "/ru/wallpapers/mountain-lake-12345/");
    }

    #[test]
    fn data_href_is_used_when_href_is_empty() {
        let html = r#"<div class="item"><a class="dl" href=" " data-href="/w/abc">x</a></div>"#;
        assert_eq!(extract_link(html, "a.dl").unwrap(), "/w/abc");

        let html = r#"<a class="dl" data-href="/w/only-data">x</a>"#;
        assert_eq!(extract_link(html, "a.dl").unwrap(), "/w/only-data");
    }

    #[test]
    fn missing_link_attributes_are_an_extraction_failure() {
        let html = r#"<a class="dl" href="" data-href="">x</a>"#;
        let err = extract_link(html, "a.dl").unwrap_err();
        assert!(matches!(err, ResolveError::MissingLink { .. }));
        assert!(matches!(PipelineError::from(err), PipelineError::Extraction(_)));
    }

    #[test]
    fn unparsable_selector_is_an_extraction_failure() {
        let err = extract_link("<a></a>", "a[[").unwrap_err();
        assert!(matches!(err, ResolveError::InvalidSelector { .. }));
    }

    #[test]
    fn relative_references_join_the_origin_without_double_slashes() {
        let listing = "https://wallscloud.net/ru/wallpapers/random";
        assert_eq!(
            absolutize(listing, "/ru/wallpapers/a-1/").unwrap(),
            "https://wallscloud.net/ru/wallpapers/a-1/"
        );
        assert_eq!(
            absolutize(listing, "ru/wallpapers/a-1").unwrap(),
            "https://wallscloud.net/ru/wallpapers/a-1"
        );
        assert_eq!(
            absolutize("http://127.0.0.1:8080/list/", "//cdn.example.com/x").unwrap(),
            "http://cdn.example.com/x"
        );
        assert_eq!(
            absolutize("http://127.0.0.1:8080/list/", "/x").unwrap(),
            "http://127.0.0.1:8080/x"
        );
    }

    #[test]
    fn absolute_references_are_kept() {
        assert_eq!(
            absolutize("https://wallscloud.net/ru", "https://cdn.example.com/w/1").unwrap(),
            "https://cdn.example.com/w/1"
        );
    }

    #[test]
    fn suffix_is_appended_with_single_separator() {
        assert_eq!(
            append_suffix("https://h.net/w/a-1/", "/1600x900/download"),
            "https://h.net/w/a-1/1600x900/download"
        );
        assert_eq!(
            append_suffix("https://h.net/w/a-1", "1600x900/download"),
            "https://h.net/w/a-1/1600x900/download"
        );
        assert_eq!(append_suffix("https://h.net/w/a-1//", ""), "https://h.net/w/a-1");
    }

    #[tokio::test]
    async fn resolves_root_relative_and_absolute_hrefs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/relative"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a class="dl" href="/wallpapers/lake-7/">x</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/absolute"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a class="dl" href="https://cdn.example.com/w/lake-7/">x</a></body></html>"#,
            ))
            .mount(&server)
            .await;

        let http = http();
        let relative = SourceResolver::new(format!("{}/relative", server.uri()), "a.dl", DEFAULT_IMAGE_SUFFIX);
        let from_relative = relative.resolve_download_url(&http).await.unwrap();
        assert_eq!(
            from_relative,
            format!("{}/wallpapers/lake-7/1600x900/download", server.uri())
        );

        let absolute = SourceResolver::new(format!("{}/absolute", server.uri()), "a.dl", DEFAULT_IMAGE_SUFFIX);
        let from_absolute = absolute.resolve_download_url(&http).await.unwrap();
        assert_eq!(from_absolute, "https://cdn.example.com/w/lake-7/1600x900/download");

        for url in [&from_relative, &from_absolute] {
            let (_, without_scheme) = url.split_once("://").unwrap();
            assert!(!without_scheme.contains("//"), "duplicated slash in {url}");
            assert!(url.ends_with(DEFAULT_IMAGE_SUFFIX));
        }
    }

    #[tokio::test]
    async fn bad_listing_status_is_a_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/random"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let resolver = SourceResolver::new(format!("{}/random", server.uri()), "a.dl", DEFAULT_IMAGE_SUFFIX);
        let err = resolver.resolve_download_url(&http()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Fetch(FetchError::HttpStatus { status: 503, .. })));
        assert!(matches!(PipelineError::from(err), PipelineError::Fetch(_)));
    }

    #[tokio::test]
    async fn refused_listing_connection_is_a_fetch_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listing = format!("http://{}/random", listener.local_addr().unwrap());
        drop(listener);

        let resolver = SourceResolver::new(listing, "a.dl", DEFAULT_IMAGE_SUFFIX);
        let err = resolver.resolve_download_url(&http()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Fetch(FetchError::Request(_))));
        assert!(matches!(PipelineError::from(err), PipelineError::Fetch(_)));
    }

    #[tokio::test]
    async fn zero_matches_is_an_extraction_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/random"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = SourceResolver::new(format!("{}/random", server.uri()), "a.dl", DEFAULT_IMAGE_SUFFIX);
        let err = resolver.resolve_download_url(&http()).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoMatch { .. }));
    }
}
