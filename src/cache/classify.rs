//! Request classification: every request maps to exactly one caching policy.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::collections::HashSet;

use crate::config::Config;
use crate::error::{Error, Result};

static IMAGE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(png|jpe?g|gif|webp|svg|avif|ico|bmp)$").expect("valid image pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::CacheFirst => "cache_first",
            Policy::NetworkFirst => "network_first",
            Policy::StaleWhileRevalidate => "stale_while_revalidate",
        }
    }
}

/// What the request is for, as reported by the caller's platform.
///
/// Only `Image` affects classification. Page loads (`Document`) and
/// programmatic calls (`Fetch`) are classified by their path like `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Image,
    Fetch,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    pub destination: Destination,
}

impl Request {
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
        Ok(Self {
            url,
            destination: Destination::Other,
        })
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Canonical cache key.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }
}

/// Fixed-precedence classifier: static assets, then API, then images, else network-first.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Option<Url>,
    static_paths: HashSet<String>,
    static_prefixes: Vec<String>,
    api_prefixes: Vec<String>,
    api_hosts: Vec<String>,
}

impl Classifier {
    pub fn new(
        origin: Option<Url>,
        static_paths: impl IntoIterator<Item = String>,
        static_prefixes: Vec<String>,
        api_prefixes: Vec<String>,
        api_hosts: Vec<String>,
    ) -> Self {
        Self {
            origin,
            static_paths: static_paths.into_iter().collect(),
            static_prefixes,
            api_prefixes,
            api_hosts: api_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base = Url::parse(&cfg.network.base_url)
            .map_err(|_| Error::InvalidUrl(cfg.network.base_url.clone()))?;
        let static_paths = manifest_urls(cfg)?
            .into_iter()
            .map(|u| u.path().to_string())
            .collect::<Vec<_>>();
        Ok(Self::new(
            Some(base),
            static_paths,
            cfg.cache.static_prefixes.clone(),
            cfg.cache.api_prefixes.clone(),
            cfg.cache.api_hosts.clone(),
        ))
    }

    pub fn classify(&self, req: &Request) -> Policy {
        let path = req.url.path();

        if self.same_origin(&req.url)
            && (self.static_paths.contains(path)
                || self.static_prefixes.iter().any(|p| path.starts_with(p.as_str())))
        {
            return Policy::CacheFirst;
        }

        let host = req.url.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.api_hosts.iter().any(|h| *h == host)
            || self.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        {
            return Policy::NetworkFirst;
        }

        if req.destination == Destination::Image || IMAGE_PATH.is_match(path) {
            return Policy::StaleWhileRevalidate;
        }

        Policy::NetworkFirst
    }

    fn same_origin(&self, url: &Url) -> bool {
        match &self.origin {
            Some(origin) => origin.origin() == url.origin(),
            None => true,
        }
    }
}

/// Absolute URLs of the static manifest, resolved against `network.base_url`.
pub fn manifest_urls(cfg: &Config) -> Result<Vec<Url>> {
    let base = Url::parse(&cfg.network.base_url)
        .map_err(|_| Error::InvalidUrl(cfg.network.base_url.clone()))?;
    cfg.cache
        .static_assets
        .iter()
        .map(|asset| base.join(asset).map_err(|_| Error::InvalidUrl(asset.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        Classifier::from_config(&cfg).unwrap()
    }

    fn classify(url: &str) -> Policy {
        classifier().classify(&Request::get(url).unwrap())
    }

    #[test]
    fn static_manifest_is_cache_first() {
        assert_eq!(classify("http://localhost:5173/"), Policy::CacheFirst);
        assert_eq!(classify("http://localhost:5173/index.html"), Policy::CacheFirst);
        assert_eq!(classify("http://localhost:5173/assets/app.js"), Policy::CacheFirst);
    }

    #[test]
    fn static_prefix_wins_over_image_extension() {
        assert_eq!(classify("http://localhost:5173/assets/logo.png"), Policy::CacheFirst);
    }

    #[test]
    fn static_paths_only_match_the_app_origin() {
        assert_eq!(classify("https://cdn.example.com/index.html"), Policy::NetworkFirst);
    }

    #[test]
    fn api_paths_and_hosts_are_network_first() {
        assert_eq!(classify("http://localhost:5173/api/news?page=1"), Policy::NetworkFirst);
        assert_eq!(
            classify("https://newsapi.org/v2/everything?q=rust"),
            Policy::NetworkFirst
        );
        assert_eq!(classify("https://NEWSAPI.org/thumb.png"), Policy::NetworkFirst);
    }

    #[test]
    fn images_are_stale_while_revalidate() {
        assert_eq!(
            classify("https://images.example.com/photo.JPEG"),
            Policy::StaleWhileRevalidate
        );
        let req = Request::get("https://images.unsplash.com/photo-1551650975?w=400")
            .unwrap()
            .with_destination(Destination::Image);
        assert_eq!(classifier().classify(&req), Policy::StaleWhileRevalidate);
    }

    #[test]
    fn non_image_destinations_follow_the_path() {
        let classifier = classifier();
        let page = Request::get("http://localhost:5173/index.html")
            .unwrap()
            .with_destination(Destination::Document);
        assert_eq!(classifier.classify(&page), Policy::CacheFirst);
        let call = Request::get("https://cdn.example.com/feed/cover.webp")
            .unwrap()
            .with_destination(Destination::Fetch);
        assert_eq!(classifier.classify(&call), Policy::StaleWhileRevalidate);
        let article = Request::get("https://example.com/story")
            .unwrap()
            .with_destination(Destination::Document);
        assert_eq!(classifier.classify(&article), Policy::NetworkFirst);
    }

    #[test]
    fn everything_else_is_network_first() {
        assert_eq!(classify("https://example.com/pwa-article"), Policy::NetworkFirst);
        assert_eq!(classify("http://localhost:5173/about"), Policy::NetworkFirst);
    }

    #[test]
    fn manifest_urls_resolve_against_base() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let urls = manifest_urls(&cfg).unwrap();
        assert_eq!(urls[1].as_str(), "http://localhost:5173/index.html");
    }

    #[test]
    fn rejects_relative_request_urls() {
        assert!(matches!(Request::get("/index.html"), Err(Error::InvalidUrl(_))));
    }
}
