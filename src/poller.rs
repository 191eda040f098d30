use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::debrid::{retry_submit, DebridClient, DebridError, RetryPolicy};
use crate::models::PollSummary;
use crate::store::{SeenStore, SettingsStore};

/// Pulls the btih info-hash out of a magnet URI, lowercased. Returns `None`
/// for anything that is not a magnet link.
pub fn extract_magnet_hash(uri: &str) -> Option<String> {
    if !uri.starts_with("magnet:") {
        return None;
    }
    let re = Regex::new(r"(?i)xt=urn:btih:([a-z0-9]{32,40})").ok()?;
    re.captures(uri)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Watches the configured feeds and forwards new magnet links to
/// Real-Debrid. One cycle runs per tick of the poll interval, plus whenever
/// the manual refresh endpoint fires.
pub struct FeedPoller {
    config: Arc<AppConfig>,
    settings: Arc<SettingsStore>,
    seen: Arc<SeenStore>,
    debrid: Arc<DebridClient>,
    http: reqwest::Client,
    cycle_lock: Mutex<()>,
}

impl FeedPoller {
    pub fn new(
        config: Arc<AppConfig>,
        settings: Arc<SettingsStore>,
        seen: Arc<SeenStore>,
        debrid: Arc<DebridClient>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.feed_timeout_seconds))
            .user_agent("rdgrab/0.1")
            .build()
            .expect("reqwest client init should not fail");

        Self {
            config,
            settings,
            seen,
            debrid,
            http,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Starts the background loop. The first cycle runs one full interval
    /// after startup, not immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.poll_interval_seconds);
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; consume it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let summary = self.poll_once().await;
                info!(
                    feeds_checked = summary.feeds_checked,
                    feeds_failed = summary.feeds_failed,
                    entries_seen = summary.entries_seen,
                    submitted = summary.submitted,
                    skipped = summary.total_skipped(),
                    failed = summary.failed,
                    "feed poll finished"
                );
            }
        })
    }

    /// Runs one poll cycle. Cycles are serialized: a manual refresh that
    /// lands while the scheduled tick is mid-cycle waits for it to finish.
    pub async fn poll_once(&self) -> PollSummary {
        let _cycle = self.cycle_lock.lock().await;
        let mut summary = PollSummary::default();

        let snapshot = self.settings.snapshot().await;
        if snapshot.rd_api_key.trim().is_empty() {
            warn!("skipping poll cycle, no Real-Debrid API key configured");
            return summary;
        }

        for feed_url in &snapshot.feeds {
            summary.feeds_checked += 1;
            if let Err(err) = self.poll_feed(feed_url, &mut summary).await {
                summary.feeds_failed += 1;
                warn!("feed {feed_url} failed: {err:#}");
            }
        }

        summary
    }

    async fn poll_feed(&self, feed_url: &str, summary: &mut PollSummary) -> anyhow::Result<()> {
        let response = self
            .http
            .get(feed_url)
            .send()
            .await
            .with_context(|| format!("fetching {feed_url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("feed returned HTTP {status}");
        }
        let body = response.bytes().await.context("reading feed body")?;
        let feed = feed_rs::parser::parse(body.as_ref())
            .with_context(|| format!("parsing {feed_url}"))?;

        for entry in feed.entries {
            summary.entries_seen += 1;

            // Only the first link counts, and only if it looks like a magnet.
            let Some(link) = entry.links.first() else {
                continue;
            };
            let href = link.href.clone();
            if !href.contains("magnet") {
                continue;
            }

            if self.seen.contains(&href).await {
                summary.skipped_seen += 1;
                continue;
            }

            if self.already_on_debrid(&href).await {
                self.seen.record(&href).await?;
                summary.skipped_cached += 1;
                continue;
            }

            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.as_str())
                .unwrap_or("(untitled)");
            match self.submit_magnet(&href).await {
                Ok(id) => {
                    self.seen.record(&href).await?;
                    summary.submitted += 1;
                    info!("submitted \"{title}\" to Real-Debrid as {id}");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!("submitting \"{title}\" failed: {err}");
                }
            }
        }

        Ok(())
    }

    /// Best-effort check whether the magnet's info-hash already sits in the
    /// account's torrent list. A failed lookup counts as "not there" and the
    /// submission proceeds.
    async fn already_on_debrid(&self, magnet: &str) -> bool {
        let Some(hash) = extract_magnet_hash(magnet) else {
            return false;
        };
        match self.debrid.torrent_summaries().await {
            Ok(torrents) => torrents.iter().any(|t| t.hash.eq_ignore_ascii_case(&hash)),
            Err(err) => {
                debug!("torrent list lookup failed: {err}");
                false
            }
        }
    }

    /// Submits one magnet with retries, then selects all files so the
    /// transfer starts. A selectFiles failure is logged and the magnet still
    /// counts as submitted.
    async fn submit_magnet(&self, magnet: &str) -> Result<String, DebridError> {
        let policy = RetryPolicy::from_config(&self.config);
        let added = retry_submit(
            policy,
            || self.debrid.add_magnet(magnet),
            || self.debrid.refresh_token(),
        )
        .await?;

        if let Err(err) = self.debrid.select_files(&added.id, "all").await {
            warn!("selecting files for {} failed: {err}", added.id);
        }
        Ok(added.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=example";

    #[test]
    fn extracts_lowercased_infohash() {
        let uri = "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=x";
        assert_eq!(
            extract_magnet_hash(uri).as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
    }

    #[test]
    fn accepts_base32_hashes() {
        let uri = "magnet:?xt=urn:btih:ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        assert_eq!(
            extract_magnet_hash(uri).as_deref(),
            Some("abcdefghijklmnopqrstuvwxyz234567")
        );
    }

    #[test]
    fn rejects_non_magnet_uris() {
        let uri = "https://example.com/?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        assert_eq!(extract_magnet_hash(uri), None);
    }

    #[test]
    fn rejects_magnets_without_btih() {
        assert_eq!(extract_magnet_hash("magnet:?dn=just-a-name"), None);
    }

    fn rss_feed(items: &[(&str, &str)]) -> String {
        let mut body = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\">\n<channel>\n<title>Test Feed</title>\n",
        );
        for (title, link) in items {
            body.push_str(&format!(
                "<item><title>{title}</title><link>{}</link></item>\n",
                link.replace('&', "&amp;")
            ));
        }
        body.push_str("</channel>\n</rss>\n");
        body
    }

    async fn build_poller(
        feeds: Vec<String>,
        debrid_url: String,
        api_key: &str,
    ) -> (FeedPoller, Arc<SeenStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(AppConfig {
            submit_retry_backoff_sec: 0.0,
            feed_timeout_seconds: 5,
            debrid_timeout_seconds: 5,
            ..AppConfig::default()
        });

        let settings =
            Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
        if !api_key.is_empty() {
            settings.set_rd_api_key(api_key).await.unwrap();
        }
        for feed in feeds {
            settings.add_feed(&feed).await.unwrap();
        }

        let seen = Arc::new(SeenStore::open(dir.path().join("seen.json")).unwrap());
        let debrid = Arc::new(DebridClient::with_base_url(
            debrid_url,
            Duration::from_secs(5),
            settings.clone(),
        ));
        let poller = FeedPoller::new(config, settings, seen.clone(), debrid);
        (poller, seen, dir)
    }

    #[tokio::test]
    async fn submits_new_magnets_and_skips_them_next_cycle() {
        let mut feed_server = mockito::Server::new_async().await;
        let _feed = feed_server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_header("content-type", "application/rss+xml")
            .with_body(rss_feed(&[
                ("A magnet item", MAGNET),
                ("A web item", "https://example.com/post/1"),
            ]))
            .expect(2)
            .create_async()
            .await;

        let mut debrid_server = mockito::Server::new_async().await;
        let _torrents = debrid_server
            .mock("GET", "/torrents")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;
        let add = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .match_body(mockito::Matcher::UrlEncoded(
                "magnet".into(),
                MAGNET.into(),
            ))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "T1", "uri": "https://example.test/torrents/info/T1"}"#)
            .expect(1)
            .create_async()
            .await;
        let select = debrid_server
            .mock("POST", "/torrents/selectFiles/T1")
            .match_body(mockito::Matcher::UrlEncoded("files".into(), "all".into()))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let (poller, seen, _dir) = build_poller(
            vec![format!("{}/feed.xml", feed_server.url())],
            debrid_server.url(),
            "testkey",
        )
        .await;

        let first = poller.poll_once().await;
        assert_eq!(first.feeds_checked, 1);
        assert_eq!(first.feeds_failed, 0);
        assert_eq!(first.entries_seen, 2);
        assert_eq!(first.submitted, 1);
        assert_eq!(first.skipped_seen, 0);
        assert_eq!(first.failed, 0);
        assert!(seen.contains(MAGNET).await);

        let second = poller.poll_once().await;
        assert_eq!(second.entries_seen, 2);
        assert_eq!(second.submitted, 0);
        assert_eq!(second.skipped_seen, 1);

        add.assert_async().await;
        select.assert_async().await;
    }

    #[tokio::test]
    async fn only_the_first_link_of_an_entry_is_examined() {
        // Atom keeps link order; the magnet hides behind a details link.
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <feed xmlns=\"http://www.w3.org/2005/Atom\">\n\
             <title>Test Feed</title>\n\
             <entry>\n\
             <title>Buried magnet</title>\n\
             <link href=\"https://example.com/details/1\"/>\n\
             <link href=\"{}\"/>\n\
             </entry>\n\
             </feed>\n",
            MAGNET.replace('&', "&amp;")
        );

        let mut feed_server = mockito::Server::new_async().await;
        let _feed = feed_server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_header("content-type", "application/atom+xml")
            .with_body(body)
            .create_async()
            .await;

        let mut debrid_server = mockito::Server::new_async().await;
        let add = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .expect(0)
            .create_async()
            .await;

        let (poller, seen, _dir) = build_poller(
            vec![format!("{}/feed.xml", feed_server.url())],
            debrid_server.url(),
            "testkey",
        )
        .await;

        let summary = poller.poll_once().await;
        assert_eq!(summary.entries_seen, 1);
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.failed, 0);
        assert!(!seen.contains(MAGNET).await);

        add.assert_async().await;
    }

    #[tokio::test]
    async fn magnets_already_on_the_account_are_recorded_not_resubmitted() {
        let mut feed_server = mockito::Server::new_async().await;
        let _feed = feed_server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_body(rss_feed(&[("Already there", MAGNET)]))
            .create_async()
            .await;

        let mut debrid_server = mockito::Server::new_async().await;
        let _torrents = debrid_server
            .mock("GET", "/torrents")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id": "OLD1", "hash": "0123456789ABCDEF0123456789ABCDEF01234567", "status": "downloaded"}]"#,
            )
            .create_async()
            .await;
        let add = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .expect(0)
            .create_async()
            .await;

        let (poller, seen, _dir) = build_poller(
            vec![format!("{}/feed.xml", feed_server.url())],
            debrid_server.url(),
            "testkey",
        )
        .await;

        let summary = poller.poll_once().await;
        assert_eq!(summary.skipped_cached, 1);
        assert_eq!(summary.submitted, 0);
        assert!(seen.contains(MAGNET).await);

        add.assert_async().await;
    }

    #[tokio::test]
    async fn a_broken_feed_does_not_abort_the_cycle() {
        let mut feed_server = mockito::Server::new_async().await;
        let _bad = feed_server
            .mock("GET", "/bad.xml")
            .with_status(500)
            .create_async()
            .await;
        let _good = feed_server
            .mock("GET", "/good.xml")
            .with_status(200)
            .with_body(rss_feed(&[("Fresh", MAGNET)]))
            .create_async()
            .await;

        let mut debrid_server = mockito::Server::new_async().await;
        let _torrents = debrid_server
            .mock("GET", "/torrents")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let _add = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .with_status(201)
            .with_body(r#"{"id": "T2", "uri": ""}"#)
            .create_async()
            .await;
        let _select = debrid_server
            .mock("POST", "/torrents/selectFiles/T2")
            .with_status(204)
            .create_async()
            .await;

        let (poller, _seen, _dir) = build_poller(
            vec![
                format!("{}/bad.xml", feed_server.url()),
                format!("{}/good.xml", feed_server.url()),
            ],
            debrid_server.url(),
            "testkey",
        )
        .await;

        let summary = poller.poll_once().await;
        assert_eq!(summary.feeds_checked, 2);
        assert_eq!(summary.feeds_failed, 1);
        assert_eq!(summary.submitted, 1);
    }

    #[tokio::test]
    async fn polling_without_an_api_key_touches_nothing() {
        let mut feed_server = mockito::Server::new_async().await;
        let feed = feed_server
            .mock("GET", "/feed.xml")
            .expect(0)
            .create_async()
            .await;

        let (poller, _seen, _dir) = build_poller(
            vec![format!("{}/feed.xml", feed_server.url())],
            "http://127.0.0.1:1".to_string(),
            "",
        )
        .await;

        let summary = poller.poll_once().await;
        assert_eq!(summary.feeds_checked, 0);
        assert_eq!(summary.submitted, 0);

        feed.assert_async().await;
    }

    #[tokio::test]
    async fn submission_failures_are_counted_and_do_not_stop_the_entry_loop() {
        let other_magnet =
            "magnet:?xt=urn:btih:fedcba9876543210fedcba9876543210fedcba98&dn=other";

        let mut feed_server = mockito::Server::new_async().await;
        let _feed = feed_server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_body(rss_feed(&[("Bad one", MAGNET), ("Good one", other_magnet)]))
            .create_async()
            .await;

        let mut debrid_server = mockito::Server::new_async().await;
        let _torrents = debrid_server
            .mock("GET", "/torrents")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        // First magnet is rejected outright, second is accepted.
        let _reject = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .match_body(mockito::Matcher::UrlEncoded(
                "magnet".into(),
                MAGNET.into(),
            ))
            .with_status(400)
            .with_body(r#"{"error": "infringing_file"}"#)
            .create_async()
            .await;
        let _accept = debrid_server
            .mock("POST", "/torrents/addMagnet")
            .match_body(mockito::Matcher::UrlEncoded(
                "magnet".into(),
                other_magnet.into(),
            ))
            .with_status(201)
            .with_body(r#"{"id": "T3", "uri": ""}"#)
            .create_async()
            .await;
        let _select = debrid_server
            .mock("POST", "/torrents/selectFiles/T3")
            .with_status(204)
            .create_async()
            .await;

        let (poller, seen, _dir) = build_poller(
            vec![format!("{}/feed.xml", feed_server.url())],
            debrid_server.url(),
            "testkey",
        )
        .await;

        let summary = poller.poll_once().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.submitted, 1);
        // Failed submissions stay unrecorded so the next cycle retries them.
        assert!(!seen.contains(MAGNET).await);
        assert!(seen.contains(other_magnet).await);
    }
}
