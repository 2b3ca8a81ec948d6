//! Forum watcher: polls the board feed and announces new posts.
//!
//! # Architecture
//!
//! - [`diff`] - Selects entries newer than the watermark
//! - [`scheduler`] - Fixed-cadence, cancellable polling loop
//! - [`ForumWatcher`] - Start/stop lifecycle and subscriber fan-out
//!
//! The poll loop runs on one dedicated tokio task and is the only writer of
//! the watermark. Each tick fetches the feed, diffs it against the watermark
//! and, when new entries exist, advances the watermark and calls every
//! subscriber in registration order on that same task.
//!
//! # Example
//!
//! ```ignore
//! let mut watcher = ForumWatcher::new(source);
//! watcher.subscribe(|entries| {
//!     for entry in entries {
//!         println!("{} by {}", entry.title, entry.author);
//!     }
//!     Ok(())
//! });
//! watcher.start()?;
//! // ...
//! watcher.stop().await?;
//! ```

pub mod diff;
pub mod scheduler;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::feed::{Entry, FeedSource, FetchError, FetchFeed, HttpFeedFetcher};
use scheduler::{panic_message, PollStats, Tick};

/// Lifecycle misuse and subscriber failures.
#[derive(Debug, Error)]
pub enum WatchError {
    /// `start()` called while the poll loop is already running
    #[error("Watcher is already running")]
    AlreadyRunning,
    /// `stop()` called without a running poll loop
    #[error("Watcher is not running")]
    NotRunning,
    /// A subscriber returned an error or panicked
    #[error("Subscriber {index} failed: {reason}")]
    Subscriber { index: usize, reason: String },
    /// The poll task ended abnormally
    #[error("Poll task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lifecycle state of a [`ForumWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatcherState {
    Idle = 0,
    Running = 1,
    /// Cancellation requested, poll loop not yet joined.
    Stopping = 2,
}

impl WatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WatcherState::Running,
            2 => WatcherState::Stopping,
            _ => WatcherState::Idle,
        }
    }
}

/// How the watermark is initialized when a watcher is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatermarkInit {
    /// Wall-clock time at construction. Posts that already exist when the
    /// bridge starts are never announced.
    #[default]
    StartupTime,
    /// An explicit starting point.
    At(DateTime<Utc>),
}

impl WatermarkInit {
    fn resolve(self) -> DateTime<Utc> {
        match self {
            WatermarkInit::StartupTime => Utc::now(),
            WatermarkInit::At(ts) => ts,
        }
    }
}

/// Callback invoked with each batch of new entries.
pub type Subscriber = Arc<dyn Fn(&[Entry]) -> anyhow::Result<()> + Send + Sync>;

/// Read-only view of a watcher, cheap to clone and safe to query from any task.
#[derive(Debug, Clone)]
pub struct WatcherStatus {
    state: Arc<AtomicU8>,
    watermark: watch::Receiver<DateTime<Utc>>,
}

impl WatcherStatus {
    pub fn state(&self) -> WatcherState {
        WatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        *self.watermark.borrow()
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<PollStats>,
}

/// Watches one phpBB forum and notifies subscribers about new posts.
///
/// Generic over the fetch capability so tests can substitute an in-memory
/// feed. [`ForumWatcher::new`] uses [`HttpFeedFetcher`].
pub struct ForumWatcher<F: FetchFeed + 'static = HttpFeedFetcher> {
    source: Arc<FeedSource>,
    fetcher: Arc<F>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    state: Arc<AtomicU8>,
    watermark: Arc<watch::Sender<DateTime<Utc>>>,
    running: Option<RunningLoop>,
}

impl ForumWatcher<HttpFeedFetcher> {
    pub fn new(source: FeedSource) -> Self {
        Self::with_fetcher(source, HttpFeedFetcher::new())
    }
}

impl<F: FetchFeed + 'static> ForumWatcher<F> {
    pub fn with_fetcher(source: FeedSource, fetcher: F) -> Self {
        Self::with_initial_watermark(source, fetcher, WatermarkInit::StartupTime)
    }

    pub fn with_initial_watermark(source: FeedSource, fetcher: F, init: WatermarkInit) -> Self {
        let (watermark, _) = watch::channel(init.resolve());
        Self {
            source: Arc::new(source),
            fetcher: Arc::new(fetcher),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(AtomicU8::new(WatcherState::Idle as u8)),
            watermark: Arc::new(watermark),
            running: None,
        }
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Registers a callback for new entries.
    ///
    /// Callbacks run synchronously on the poll task, in registration order.
    /// Their running time counts toward the tick, so slow work delays the
    /// next poll but never overlaps it. An error or panic in one callback is
    /// logged and does not prevent the others from running.
    pub fn subscribe<H>(&self, handler: H)
    where
        H: Fn(&[Entry]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Arc::new(handler));
    }

    /// Starts the poll loop on the current tokio runtime.
    ///
    /// The first poll happens immediately.
    ///
    /// # Errors
    ///
    /// [`WatchError::AlreadyRunning`] if the loop is running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.running.is_some() {
            return Err(WatchError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let mut task = PollTask {
            source: Arc::clone(&self.source),
            fetcher: Arc::clone(&self.fetcher),
            subscribers: Arc::clone(&self.subscribers),
            watermark: Arc::clone(&self.watermark),
        };
        let interval = self.source.poll_interval;
        let token = cancel.clone();

        self.state.store(WatcherState::Running as u8, Ordering::Release);
        let handle = tokio::spawn(async move { scheduler::run(&mut task, interval, token).await });
        self.running = Some(RunningLoop { cancel, handle });

        tracing::info!(
            forum_id = self.source.forum_id,
            base_url = %self.source.base_url,
            interval_secs = interval.as_secs(),
            watermark = %self.last_update(),
            "Forum watcher running"
        );
        Ok(())
    }

    /// Cancels the poll loop and waits until it has exited.
    ///
    /// A tick in progress is allowed to finish; a pending sleep is cut short.
    ///
    /// # Errors
    ///
    /// - [`WatchError::NotRunning`] if the loop was never started or already stopped
    /// - [`WatchError::Join`] if the poll task ended abnormally
    pub async fn stop(&mut self) -> Result<PollStats, WatchError> {
        let running = self.running.take().ok_or(WatchError::NotRunning)?;

        self.state.store(WatcherState::Stopping as u8, Ordering::Release);
        running.cancel.cancel();
        let result = running.handle.await;
        self.state.store(WatcherState::Idle as u8, Ordering::Release);

        let stats = result?;
        tracing::info!(
            forum_id = self.source.forum_id,
            ticks = stats.ticks,
            failures = stats.failures,
            "Forum watcher stopped"
        );
        Ok(stats)
    }

    pub fn state(&self) -> WatcherState {
        WatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Current watermark: the feed timestamp of the last poll that found new posts.
    pub fn last_update(&self) -> DateTime<Utc> {
        *self.watermark.borrow()
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            state: Arc::clone(&self.state),
            watermark: self.watermark.subscribe(),
        }
    }
}

impl<F: FetchFeed + 'static> Drop for ForumWatcher<F> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

/// State owned by the poll task for the lifetime of one run.
struct PollTask<F> {
    source: Arc<FeedSource>,
    fetcher: Arc<F>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    watermark: Arc<watch::Sender<DateTime<Utc>>>,
}

impl<F: FetchFeed> PollTask<F> {
    fn notify(&self, entries: &[Entry]) {
        // Snapshot so callbacks can subscribe without deadlocking
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (index, subscriber) in subscribers.iter().enumerate() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(entries)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            let err = WatchError::Subscriber { index, reason };
            tracing::warn!(forum_id = self.source.forum_id, error = %err, "Subscriber failed");
        }
    }
}

impl<F: FetchFeed> Tick for PollTask<F> {
    type Error = FetchError;

    async fn tick(&mut self) -> Result<(), FetchError> {
        let document = self.fetcher.fetch(&self.source).await?;

        let watermark = *self.watermark.borrow();
        let diff = diff::diff(document, watermark)?;

        if diff.is_empty() {
            tracing::debug!(forum_id = self.source.forum_id, "No new posts");
            return Ok(());
        }

        self.watermark.send_replace(diff.watermark);
        tracing::info!(
            forum_id = self.source.forum_id,
            count = diff.entries.len(),
            watermark = %diff.watermark,
            "New forum posts"
        );

        self.notify(&diff.entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedDocument;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use url::Url;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn entry(title: &str, updated: &str) -> Entry {
        Entry {
            title: title.to_string(),
            author: "alice".to_string(),
            link: format!("https://forum.example.org/{}", title),
            published: None,
            updated: ts(updated),
        }
    }

    fn doc(updated: &str, entries: Vec<Entry>) -> FeedDocument {
        FeedDocument {
            updated: Some(ts(updated)),
            entries,
        }
    }

    fn source(interval: Duration) -> FeedSource {
        FeedSource::new(
            Url::parse("https://forum.example.org/").unwrap(),
            2,
            interval,
        )
    }

    enum Step {
        Doc(FeedDocument),
        /// Document delivered after a delay.
        Slow(Duration, FeedDocument),
        Fail,
        Panic,
    }

    /// Plays back scripted results; the last step repeats forever.
    struct ScriptedFetcher {
        steps: Mutex<Vec<Step>>,
        calls: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedFetcher {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps),
                calls: AtomicUsize::new(0),
                call_times: Mutex::new(Vec::new()),
            }
        }
    }

    impl FetchFeed for ScriptedFetcher {
        async fn fetch(&self, _source: &FeedSource) -> Result<FeedDocument, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());

            let (delay, outcome) = {
                let steps = self.steps.lock().unwrap();
                match steps.get(call).or_else(|| steps.last()) {
                    Some(Step::Doc(doc)) => (None, Some(Ok(doc.clone()))),
                    Some(Step::Slow(d, doc)) => (Some(*d), Some(Ok(doc.clone()))),
                    Some(Step::Fail) => (None, Some(Err(FetchError::HttpStatus(503)))),
                    Some(Step::Panic) | None => (None, None),
                }
            };
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            // Panic outside the lock so the script stays usable
            outcome.unwrap_or_else(|| panic!("fetcher exploded"))
        }
    }

    type Watcher = ForumWatcher<ScriptedFetcher>;

    fn watcher(steps: Vec<Step>, interval: Duration, watermark: &str) -> Watcher {
        ForumWatcher::with_initial_watermark(
            source(interval),
            ScriptedFetcher::new(steps),
            WatermarkInit::At(ts(watermark)),
        )
    }

    fn collect_batches(watcher: &Watcher) -> mpsc::UnboundedReceiver<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        watcher.subscribe(move |entries| {
            let titles = entries.iter().map(|e| e.title.clone()).collect();
            tx.send(titles)
                .map_err(|_| anyhow::anyhow!("test receiver dropped"))
        });
        rx
    }

    async fn wait_for_calls(watcher: &Watcher, n: usize) {
        while watcher.fetcher.calls.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_new_entries_and_advances_watermark() {
        let feed = doc(
            "2013-01-02T00:00:00Z",
            vec![
                entry("A", "2013-01-01T12:00:00Z"),
                entry("B", "2012-12-31T00:00:00Z"),
            ],
        );
        let mut watcher = watcher(
            vec![Step::Doc(feed)],
            Duration::from_secs(30),
            "2013-01-01T00:00:00Z",
        );
        let mut batches = collect_batches(&watcher);

        watcher.start().unwrap();
        let batch = batches.recv().await.unwrap();

        assert_eq!(batch, vec!["A"]);
        assert_eq!(watcher.last_update(), ts("2013-01-02T00:00:00Z"));
        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_feed_is_not_delivered_twice() {
        let feed = doc(
            "2013-01-02T00:00:00Z",
            vec![entry("A", "2013-01-01T12:00:00Z")],
        );
        let mut watcher = watcher(
            vec![Step::Doc(feed)],
            Duration::from_secs(10),
            "2013-01-01T00:00:00Z",
        );
        let mut batches = collect_batches(&watcher);

        watcher.start().unwrap();
        wait_for_calls(&watcher, 3).await;
        watcher.stop().await.unwrap();

        assert_eq!(batches.recv().await.unwrap(), vec!["A"]);
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_keeps_watermark_and_next_tick_runs_on_time() {
        let feed = doc(
            "2013-01-02T00:00:00Z",
            vec![entry("A", "2013-01-01T12:00:00Z")],
        );
        let mut watcher = watcher(
            vec![Step::Fail, Step::Doc(feed)],
            Duration::from_secs(10),
            "2013-01-01T00:00:00Z",
        );
        let mut batches = collect_batches(&watcher);

        watcher.start().unwrap();
        wait_for_calls(&watcher, 1).await;
        assert_eq!(watcher.last_update(), ts("2013-01-01T00:00:00Z"));

        assert_eq!(batches.recv().await.unwrap(), vec!["A"]);
        let stats = watcher.stop().await.unwrap();

        let times = watcher.fetcher.call_times.lock().unwrap().clone();
        assert_eq!(times[1] - times[0], Duration::from_secs(10));
        assert!(stats.failures >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_does_not_kill_loop() {
        let feed = doc(
            "2013-01-02T00:00:00Z",
            vec![entry("A", "2013-01-01T12:00:00Z")],
        );
        let mut watcher = watcher(
            vec![Step::Panic, Step::Doc(feed)],
            Duration::from_secs(5),
            "2013-01-01T00:00:00Z",
        );
        let mut batches = collect_batches(&watcher);

        watcher.start().unwrap();
        assert_eq!(batches.recv().await.unwrap(), vec!["A"]);
        assert!(watcher.is_running());
        watcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watermark_is_monotonic_across_polls() {
        let mut watcher = watcher(
            vec![
                Step::Doc(doc(
                    "2013-01-05T00:00:00Z",
                    vec![entry("A", "2013-01-04T00:00:00Z")],
                )),
                // Stale document claiming an older timestamp
                Step::Doc(doc(
                    "2013-01-03T00:00:00Z",
                    vec![entry("B", "2013-01-06T00:00:00Z")],
                )),
                Step::Doc(doc("2013-01-07T00:00:00Z", vec![])),
            ],
            Duration::from_secs(10),
            "2013-01-01T00:00:00Z",
        );
        let status = watcher.status();
        let mut batches = collect_batches(&watcher);

        let mut seen = vec![status.last_update()];
        watcher.start().unwrap();
        for n in 1..=3 {
            wait_for_calls(&watcher, n).await;
            seen.push(status.last_update());
        }
        watcher.stop().await.unwrap();

        assert_eq!(
            seen,
            vec![
                ts("2013-01-01T00:00:00Z"),
                ts("2013-01-05T00:00:00Z"),
                // B was new, but the stale document timestamp cannot pull it back
                ts("2013-01-05T00:00:00Z"),
                // Empty poll leaves it alone even though the document says 01-07
                ts("2013-01-05T00:00:00Z"),
            ]
        );
        assert_eq!(batches.recv().await.unwrap(), vec!["A"]);
        assert_eq!(batches.recv().await.unwrap(), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_called_in_order_and_isolated() {
        let feed = doc(
            "2013-01-02T00:00:00Z",
            vec![entry("A", "2013-01-01T12:00:00Z")],
        );
        let mut watcher = watcher(
            vec![Step::Doc(feed)],
            Duration::from_secs(30),
            "2013-01-01T00:00:00Z",
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        watcher.subscribe(move |_| {
            o.lock().unwrap().push("first");
            Err(anyhow::anyhow!("relay offline"))
        });
        let o = Arc::clone(&order);
        watcher.subscribe(move |_| {
            o.lock().unwrap().push("second");
            panic!("subscriber bug");
        });
        let o = Arc::clone(&order);
        watcher.subscribe(move |_| {
            o.lock().unwrap().push("third");
            Ok(())
        });
        let mut batches = collect_batches(&watcher);

        watcher.start().unwrap();
        assert_eq!(batches.recv().await.unwrap(), vec!["A"]);
        watcher.stop().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_errors_and_state() {
        let mut watcher = watcher(
            vec![Step::Doc(FeedDocument::default())],
            Duration::from_secs(30),
            "2013-01-01T00:00:00Z",
        );
        let status = watcher.status();

        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(matches!(watcher.stop().await, Err(WatchError::NotRunning)));

        watcher.start().unwrap();
        assert!(watcher.is_running());
        assert!(status.is_running());
        assert!(matches!(watcher.start(), Err(WatchError::AlreadyRunning)));

        watcher.stop().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(!status.is_running());
        assert!(matches!(watcher.stop().await, Err(WatchError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_sleep_returns_promptly() {
        let mut watcher = watcher(
            vec![Step::Doc(FeedDocument::default())],
            Duration::from_secs(3600),
            "2013-01-01T00:00:00Z",
        );

        watcher.start().unwrap();
        wait_for_calls(&watcher, 1).await;

        let before = Instant::now();
        let stats = watcher.stop().await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(200));
        assert_eq!(stats.ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_stopping_until_tick_in_progress_finishes() {
        let mut watcher = watcher(
            vec![Step::Slow(Duration::from_secs(20), FeedDocument::default())],
            Duration::from_secs(60),
            "2013-01-01T00:00:00Z",
        );
        let status = watcher.status();

        watcher.start().unwrap();
        wait_for_calls(&watcher, 1).await;

        let stop = watcher.stop();
        tokio::pin!(stop);
        tokio::select! {
            biased;
            _ = &mut stop => panic!("stop returned while the fetch was still running"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
        assert_eq!(status.state(), WatcherState::Stopping);
        assert!(!status.is_running());

        let stats = stop.await.unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(status.state(), WatcherState::Idle);
    }

    #[test]
    fn test_startup_time_watermark_is_now() {
        let before = Utc::now();
        let watcher = ForumWatcher::with_fetcher(
            source(Duration::from_secs(30)),
            ScriptedFetcher::new(vec![Step::Fail]),
        );
        let after = Utc::now();

        assert!(watcher.last_update() >= before);
        assert!(watcher.last_update() <= after);
        assert_eq!(watcher.state(), WatcherState::Idle);
    }
}
