use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{spawn_blocking, JoinSet};
use tracing::{info, warn};

use crate::config::HarvestConfig;
use crate::database::Database;
use crate::notify::{notify_within, NoopNotifier, Notifier, Urgency};
use crate::webnovel::{ComicSource, WebNovel};
use crate::{info_time, Error, Result};

/// Capacity of the channel between upload time fetchers and the store writer.
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// What a single run discovered, fetched and wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    pub comics: usize,
    pub chapters: usize,
    pub cached: usize,
    pub fetched: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub documents: usize,
}

/// Opens the store, connects to the API and runs one full harvest.
pub async fn harvest_site(config: &HarvestConfig) -> Result<HarvestStats> {
    let start_time = Local::now();
    info_time!("Started harvesting with {} workers", config.workers);

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let database = Database::open(config.database_path())?;
    let webnovel = WebNovel::connect(config).await?;

    let notifier = webnovel.notifier();
    let stats = Harvester::new(
        Arc::new(webnovel),
        Arc::new(database),
        config.workers,
        config.build_dir.clone(),
    )
    .with_notifier(notifier, config.retry.notify_timeout)
    .run()
    .await?;

    info_time!(start_time, "Finished harvest: {:?}", stats);
    Ok(stats)
}

/// Drives the discovery, fetch and render stages. Stages run one after
/// another; inside a stage at most `workers` requests are in flight.
pub struct Harvester {
    source: Arc<dyn ComicSource>,
    database: Arc<Database>,
    workers: usize,
    build_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
}

impl Harvester {
    pub fn new(
        source: Arc<dyn ComicSource>,
        database: Arc<Database>,
        workers: usize,
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            database,
            workers: workers.max(1),
            build_dir: build_dir.into(),
            notifier: Arc::new(NoopNotifier),
            notify_timeout: Duration::from_secs(10),
        }
    }

    /// Sink for the run level summary of skipped chapters.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        self.notifier = notifier;
        self.notify_timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<HarvestStats> {
        let mut stats = HarvestStats::default();

        let comic_ids = self.discover_comics().await?;
        stats.comics = comic_ids.len();

        let chapters = self.discover_chapters(comic_ids).await?;
        stats.chapters = chapters.len();

        self.fetch_upload_times(chapters, &mut stats).await?;

        stats.documents = render(&self.database, &self.build_dir).await?;
        Ok(stats)
    }

    /// Stage 1: every comic id across all listing pages. Any failed page aborts.
    pub async fn discover_comics(&self) -> Result<BTreeSet<i64>> {
        let start_time = Local::now();
        let page_info = self.source.pagination_info().await?;
        if page_info.page_size == 0 && page_info.total > 0 {
            return Err(Error::MalformedResponse {
                operation: "pagination info".to_string(),
                reason: format!(
                    "first page is empty but {} items were reported",
                    page_info.total
                ),
            });
        }
        let pages: Vec<u64> = (1..=page_info.page_count()).collect();
        info_time!(
            "Getting comic ids from {} pages ({} per page, {} total)",
            pages.len(),
            page_info.page_size,
            page_info.total
        );

        let results = fan_out(self.workers, "comic listing", pages, {
            let source = self.source.clone();
            move |page| {
                let source = source.clone();
                async move { source.comic_ids(page).await }
            }
        })
        .await?;

        let mut seen = 0;
        let mut comic_ids = BTreeSet::new();
        for (_page, ids) in results {
            let ids = ids?;
            seen += ids.len();
            comic_ids.extend(ids);
        }
        if seen > comic_ids.len() {
            warn!(
                collapsed = seen - comic_ids.len(),
                "same comic id listed on more than one page"
            );
        }

        info_time!(start_time, "Found {} comics", comic_ids.len());
        Ok(comic_ids)
    }

    /// Stage 2: every (comic, chapter) pair. Any failed chapter list aborts.
    pub async fn discover_chapters(&self, comic_ids: BTreeSet<i64>) -> Result<BTreeSet<(i64, i64)>> {
        let start_time = Local::now();
        info_time!("Getting chapter ids for {} comics", comic_ids.len());

        let results = fan_out(
            self.workers,
            "chapter lists",
            comic_ids.into_iter().collect(),
            {
                let source = self.source.clone();
                move |comic_id| {
                    let source = source.clone();
                    async move { source.chapter_ids(comic_id).await }
                }
            },
        )
        .await?;

        let mut chapters = BTreeSet::new();
        for (comic_id, chapter_ids) in results {
            chapters.extend(chapter_ids?.into_iter().map(|chapter_id| (comic_id, chapter_id)));
        }

        info_time!(start_time, "Found {} chapters", chapters.len());
        Ok(chapters)
    }

    /// Stage 3: upload times for every pair the store doesn't know yet.
    /// A failed pair is skipped and picked up again on a later run.
    pub async fn fetch_upload_times(
        &self,
        chapters: BTreeSet<(i64, i64)>,
        stats: &mut HarvestStats,
    ) -> Result<()> {
        let start_time = Local::now();
        let total = chapters.len();

        let pending = spawn_blocking({
            let database = self.database.clone();
            move || -> Result<Vec<(i64, i64)>> {
                let mut pending = Vec::new();
                for (comic_id, chapter_id) in chapters {
                    if !database.has_chapter_upload_time(comic_id, chapter_id)? {
                        pending.push((comic_id, chapter_id));
                    }
                }
                Ok(pending)
            }
        })
        .await??;
        stats.cached += total - pending.len();
        info_time!(
            "Fetching upload time for {} chapters ({} already stored)",
            pending.len(),
            total - pending.len()
        );

        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let store_handle = spawn_blocking({
            let database = self.database.clone();
            move || store_upload_times(&database, result_rx)
        });

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut task_set = JoinSet::new();
        for (comic_id, chapter_id) in pending {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let result_tx = result_tx.clone();
            task_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let upload_time = source.chapter_upload_time(comic_id, chapter_id).await;
                result_tx
                    .send(((comic_id, chapter_id), upload_time))
                    .await
                    .map_err(|_| Error::WorkerPoolClosed)
            });
        }
        drop(result_tx);

        let mut progress = Progress::new("upload times", task_set.len());
        let mut task_error = None;
        while let Some(task) = task_set.join_next().await {
            match task {
                Ok(Ok(())) => progress.tick(),
                Ok(Err(err)) => task_error = task_error.or(Some(err)),
                Err(err) => task_error = task_error.or(Some(Error::from(err))),
            }
        }

        // A store failure closes the channel, so report it ahead of the
        // send errors it causes.
        let stored = store_handle.await??;
        if let Some(err) = task_error {
            return Err(err);
        }
        stats.fetched += stored.fetched;
        stats.failed += stored.failed;
        stats.duplicates += stored.duplicates;

        if stored.failed > 0 {
            notify_within(
                self.notifier.as_ref(),
                self.notify_timeout,
                &format!("{} chapters could not be fetched", stored.failed),
                Some("They stay missing until a later run fetches them."),
                Urgency::Urgent,
            )
            .await;
        }

        info_time!(
            start_time,
            "Stored {} new upload times, {} failed",
            stored.fetched,
            stored.failed
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreOutcome {
    fetched: usize,
    failed: usize,
    duplicates: usize,
}

/// Writes each fetched upload time as soon as it arrives. Fetch failures are
/// logged and skipped; only store errors end the run.
fn store_upload_times(
    database: &Database,
    mut result_rx: mpsc::Receiver<((i64, i64), Result<i64>)>,
) -> Result<StoreOutcome> {
    let mut outcome = StoreOutcome::default();

    while let Some(((comic_id, chapter_id), upload_time)) = result_rx.blocking_recv() {
        let upload_time = match upload_time {
            Ok(upload_time) => upload_time,
            Err(err) => {
                warn!(comic_id, chapter_id, error = %err, "skipping chapter");
                outcome.failed += 1;
                continue;
            }
        };
        match database.insert_chapter_upload_time(comic_id, chapter_id, upload_time) {
            Ok(()) => outcome.fetched += 1,
            Err(err @ Error::DuplicateKey { .. }) => {
                warn!(error = %err, "upload time was stored concurrently");
                outcome.duplicates += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(outcome)
}

/// Stage 4: one `{comic_id}.json` per stored comic, mapping chapter id to
/// upload time. Rewritten in full every run.
pub async fn render(database: &Arc<Database>, build_dir: &Path) -> Result<usize> {
    let start_time = Local::now();
    tokio::fs::create_dir_all(build_dir).await?;

    let documents = spawn_blocking({
        let database = database.clone();
        move || -> Result<Vec<(i64, Vec<u8>)>> {
            let mut documents = Vec::new();
            for comic_id in database.comic_ids()? {
                let data = database.chapter_data(comic_id)?;
                documents.push((comic_id, serde_json::to_vec(&data)?));
            }
            Ok(documents)
        }
    })
    .await??;

    for (comic_id, json) in &documents {
        tokio::fs::write(build_dir.join(format!("{comic_id}.json")), json).await?;
    }

    info_time!(
        start_time,
        "Wrote {} documents to {}",
        documents.len(),
        build_dir.display()
    );
    Ok(documents.len())
}

/// Runs `task` for every input with at most `workers` running at once and
/// returns once all of them have finished.
async fn fan_out<I, T, F, Fut>(
    workers: usize,
    stage: &'static str,
    inputs: Vec<I>,
    task: F,
) -> Result<Vec<(I, Result<T>)>>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut task_set = JoinSet::new();
    for input in inputs {
        let semaphore = semaphore.clone();
        let fut = task(input.clone());
        task_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            Ok::<_, Error>((input, fut.await))
        });
    }

    let mut progress = Progress::new(stage, task_set.len());
    let mut results = Vec::with_capacity(task_set.len());
    while let Some(task) = task_set.join_next().await {
        results.push(task??);
        progress.tick();
    }
    Ok(results)
}

/// Logs roughly every tenth of a stage.
struct Progress {
    stage: &'static str,
    total: usize,
    done: usize,
    step: usize,
}

impl Progress {
    fn new(stage: &'static str, total: usize) -> Self {
        Self {
            stage,
            total,
            done: 0,
            step: (total / 10).max(1),
        }
    }

    fn tick(&mut self) {
        self.done += 1;
        if self.done % self.step == 0 || self.done == self.total {
            info!(stage = self.stage, done = self.done, total = self.total, "progress");
        }
    }
}
