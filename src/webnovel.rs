//! Logical queries against the comic catalogue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::HarvestConfig;
use crate::notify::{NoopNotifier, Notifier, Urgency, WebhookNotifier};
use crate::parse::{self, PageInfo};
use crate::request::{HttpTransport, Requester, Sleeper, TokioSleeper, Transport};
use crate::Result;

const CATEGORY_PATH: &str = "/category/categoryAjax";
const CHAPTER_LIST_PATH: &str = "/comic/getChapterList";
const CONTENT_PATH: &str = "/comic/getContent";

/// The read-only queries the harvest pipeline needs.
#[async_trait]
pub trait ComicSource: Send + Sync {
    async fn pagination_info(&self) -> Result<PageInfo>;
    async fn comic_ids(&self, page: u64) -> Result<Vec<i64>>;
    async fn chapter_ids(&self, comic_id: i64) -> Result<Vec<i64>>;
    async fn chapter_upload_time(&self, comic_id: i64, chapter_id: i64) -> Result<i64>;
}

#[derive(Clone)]
pub struct WebNovel {
    requester: Requester,
}

impl WebNovel {
    /// Wraps an already configured requester. Nothing is sent.
    pub fn new(requester: Requester) -> Self {
        Self { requester }
    }

    /// Builds the HTTP client stack described by `config` and announces the
    /// session on the notification sink, if there is one.
    pub async fn connect(config: &HarvestConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.retry.request_timeout)?;
        let notifier = config.webhook_url.as_ref().map(|url| {
            Arc::new(WebhookNotifier::new(transport.client(), url.clone())) as Arc<dyn Notifier>
        });
        if let Some(relay) = &config.relay_url {
            info!(relay = %relay, "routing requests through relay");
        }
        Ok(Self::start_session(Arc::new(transport), Arc::new(TokioSleeper), notifier, config).await)
    }

    /// Assembles a client from its parts. The session start marker goes to
    /// `notifier` when one is given; without one notifications are dropped.
    pub async fn start_session(
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
        notifier: Option<Arc<dyn Notifier>>,
        config: &HarvestConfig,
    ) -> Self {
        let announce = notifier.is_some();
        let notifier = notifier.unwrap_or_else(|| Arc::new(NoopNotifier) as Arc<dyn Notifier>);
        let requester = Requester::new(transport, sleeper, notifier, config.retry.clone())
            .with_relay(config.relay_url.clone());

        if announce {
            requester
                .notify("Harvest session started", None, Urgency::Normal)
                .await;
        }
        Self::new(requester)
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.requester.notifier().clone()
    }

    async fn category(&self, page: Option<u64>, operation: &str) -> Result<String> {
        let mut params = vec![
            ("bookStatus", "0".to_string()),
            ("categoryId", "0".to_string()),
            ("categoryType", "2".to_string()),
            ("orderBy", "5".to_string()),
        ];
        if let Some(page) = page {
            params.push(("pageIndex", page.to_string()));
        }
        self.requester.get(operation, CATEGORY_PATH, &params).await
    }
}

#[async_trait]
impl ComicSource for WebNovel {
    async fn pagination_info(&self) -> Result<PageInfo> {
        let operation = "pagination info";
        let body = self.category(None, operation).await?;
        parse::parse_page_info(&body, operation)
    }

    async fn comic_ids(&self, page: u64) -> Result<Vec<i64>> {
        let operation = format!("comic listing page {page}");
        let body = self.category(Some(page), &operation).await?;
        parse::parse_comic_ids(&body, &operation)
    }

    async fn chapter_ids(&self, comic_id: i64) -> Result<Vec<i64>> {
        let operation = format!("chapter list for comic {comic_id}");
        let body = self
            .requester
            .get(
                &operation,
                CHAPTER_LIST_PATH,
                &[("comicId", comic_id.to_string())],
            )
            .await?;
        parse::parse_chapter_ids(&body, &operation)
    }

    async fn chapter_upload_time(&self, comic_id: i64, chapter_id: i64) -> Result<i64> {
        let operation = format!("content of comic {comic_id} chapter {chapter_id}");
        // Stage 3 skips a failed chapter, so exhaustion here is not urgent.
        let body = self
            .requester
            .get_best_effort(
                &operation,
                CONTENT_PATH,
                &[
                    ("comicId", comic_id.to_string()),
                    ("chapterId", chapter_id.to_string()),
                ],
            )
            .await?;
        parse::parse_publish_time(&body, &operation)
    }
}
