//! Feed driver: validates settings, walks pages through a bounded pipeline,
//! and merges results until a stop condition holds.
//!
//! A run moves `Idle -> Validating -> Running` and ends in `Completed`,
//! `Cancelled` or `Failed`. An empty or faulted page marks the end of the
//! feed: nothing more is submitted, earlier pages still in flight are merged,
//! and later ones are cancelled and discarded. Reaching `max_songs` discards
//! everything still in flight.
use super::aggregator::Aggregator;
use super::pipeline::{BoundedPipeline, PipelineConfig, PipelineError};
use super::rate_limit::{route_key, RateLimiter, Throttle};
use crate::context::{FeedContext, ThrottlePolicy};
use crate::error::{FeedError, TransportError};
use crate::feed::{
    DriverState, FeedDescriptor, FeedResult, FeedSettings, NormalizedItem, PageResult,
    ParseOptions,
};
use crate::transport::{Transport, TransportResponse};
use futures::Stream;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

const TOO_MANY_REQUESTS: u16 = 429;

/// Runs one feed to completion.
///
/// Never panics on expected failures: invalid settings, transport and parse
/// faults, and cancellation are all reported through [`FeedResult::error`].
pub async fn run_feed(
    ctx: &FeedContext,
    settings: &FeedSettings,
    cancel: &CancellationToken,
) -> FeedResult {
    drive(ctx, settings, cancel, None).await
}

/// Runs several feeds concurrently over one context.
///
/// Results are returned in the order of `settings`. Use
/// [`merge_results`](crate::feed::merge_results) to fold them into one map.
pub async fn run_feeds(
    ctx: &FeedContext,
    settings: &[FeedSettings],
    cancel: &CancellationToken,
) -> Vec<FeedResult> {
    futures::future::join_all(settings.iter().map(|s| run_feed(ctx, s, cancel))).await
}

/// Starts a feed run in the background and streams its merged pages.
///
/// Pages are yielded in merge order. Dropping the stream cancels the run.
pub fn stream_feed(
    ctx: &FeedContext,
    settings: &FeedSettings,
    cancel: &CancellationToken,
) -> FeedStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let run_cancel = cancel.child_token();
    let guard = run_cancel.clone().drop_guard();

    let ctx = ctx.clone();
    let settings = settings.clone();
    let task = tokio::spawn(async move { drive(&ctx, &settings, &run_cancel, Some(tx)).await });

    FeedStream {
        pages: rx,
        task,
        guard,
    }
}

/// Merged pages of a background run; see [`stream_feed`].
pub struct FeedStream {
    pages: mpsc::UnboundedReceiver<PageResult>,
    task: JoinHandle<FeedResult>,
    guard: DropGuard,
}

impl FeedStream {
    /// Waits for the run to end and returns its result. Pages not yet taken
    /// from the stream are still part of the result.
    pub async fn finish(self) -> FeedResult {
        let FeedStream { task, guard, .. } = self;
        let outcome = task.await;
        guard.disarm();
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => FeedResult::rejected(FeedError::Cancelled),
        }
    }
}

impl Stream for FeedStream {
    type Item = PageResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.pages.poll_recv(cx)
    }
}

impl std::fmt::Debug for FeedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStream")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

// ============================================================================
// Run loop
// ============================================================================

struct PageJob {
    index: usize,
    url: Url,
}

struct PageFault {
    index: usize,
    url: Url,
    error: FeedError,
}

impl PageFault {
    fn into_page(self) -> PageResult {
        PageResult::faulted(self.url, self.index, self.error)
    }
}

/// Tracks and logs the state of one run.
struct RunState {
    feed: &'static str,
    state: DriverState,
}

impl RunState {
    fn new(feed: &'static str) -> Self {
        Self {
            feed,
            state: DriverState::Idle,
        }
    }

    fn enter(&mut self, next: DriverState) {
        tracing::debug!(feed = self.feed, from = ?self.state, to = ?next, "Feed state changed");
        self.state = next;
    }
}

async fn drive(
    ctx: &FeedContext,
    settings: &FeedSettings,
    cancel: &CancellationToken,
    pages_tx: Option<mpsc::UnboundedSender<PageResult>>,
) -> FeedResult {
    let descriptor = settings.kind.descriptor();
    let mut run = RunState::new(descriptor.name);

    run.enter(DriverState::Validating);
    if let Err(reason) = (descriptor.validate)(settings) {
        tracing::warn!(feed = descriptor.name, reason = %reason, "Rejected feed settings");
        run.enter(DriverState::Failed);
        return FeedResult::rejected(FeedError::InvalidFeedSettings(reason));
    }
    if cancel.is_cancelled() {
        run.enter(DriverState::Cancelled);
        return FeedResult::rejected(FeedError::Cancelled);
    }

    run.enter(DriverState::Running);
    let concurrency = settings.effective_concurrency();
    let workers_cancel = cancel.child_token();
    let worker = Arc::new(PageWorker {
        transport: ctx.transport().clone(),
        limiter: ctx.limiter().clone(),
        throttle: ctx.throttle(),
        descriptor,
        options: ParseOptions {
            store_raw: settings.store_raw,
        },
        cancel: workers_cancel.clone(),
    });

    let mut config = PipelineConfig::new(concurrency)
        .ordered(descriptor.ordered)
        .with_capacity(concurrency);
    if let Some(slots) = ctx.shared_slots() {
        config = config.with_shared_slots(slots.clone());
    }
    let mut pipeline = BoundedPipeline::new(config, move |job: PageJob| {
        let worker = worker.clone();
        async move { worker.run(job).await }
    });

    let mut aggregator = Aggregator::new(settings);
    let mut next_page = settings.starting_page;
    let mut submitted = 0usize;
    let mut error = None;
    // Submitted pages whose results have not been taken yet
    let mut pending = BTreeSet::new();
    // Set by an empty or faulted page; later pages are past the end of the feed
    let mut last_page: Option<usize> = None;
    let mut fault: Option<PageFault> = None;

    'run: loop {
        // Keep up to `concurrency` pages in flight until the end is known
        while last_page.is_none()
            && pipeline.in_flight() < concurrency
            && (settings.max_pages == 0 || submitted < settings.max_pages)
            && !cancel.is_cancelled()
        {
            let url = match descriptor.page_url(ctx.endpoints(), settings, next_page) {
                Ok(url) => url,
                Err(e) => {
                    error = Some(FeedError::InvalidFeedSettings(format!(
                        "cannot build locator for page {}: {}",
                        next_page, e
                    )));
                    break 'run;
                }
            };
            tracing::debug!(
                feed = descriptor.name,
                page = next_page,
                url = %url,
                "Submitting page"
            );
            if let Err(e) = pipeline.try_submit(PageJob {
                index: next_page,
                url,
            }) {
                error = Some(match e {
                    PipelineError::CapacityExceeded { capacity } => {
                        FeedError::CapacityExceeded(capacity)
                    }
                    _ => FeedError::Cancelled,
                });
                break 'run;
            }
            pending.insert(next_page);
            next_page += 1;
            submitted += 1;
        }

        if let Some(last) = last_page {
            if pending.range(..last).next().is_none() {
                // Every page before the end has been taken
                break;
            }
        }

        let more = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                error = Some(FeedError::Cancelled);
                break 'run;
            }
            more = pipeline.wait_for_any() => more,
        };
        if !more {
            // Page budget spent and every submitted page merged
            break;
        }

        while let Some(outcome) = pipeline.try_take_completed() {
            match outcome {
                Ok(page) => {
                    pending.remove(&page.index);
                    if last_page.is_some_and(|last| page.index > last) {
                        tracing::trace!(
                            feed = descriptor.name,
                            page = page.index,
                            "Dropping page past the end of the feed"
                        );
                        continue;
                    }
                    if let Some(tx) = &pages_tx {
                        // The receiver may be gone; the run still completes
                        let _ = tx.send(page.clone());
                    }
                    let index = page.index;
                    let merged = aggregator.merge(page);
                    if merged.limit_reached {
                        if fault.as_ref().is_some_and(|f| f.index > index) {
                            fault = None;
                        }
                        break 'run;
                    }
                    if merged.end_of_data {
                        last_page = Some(last_page.map_or(index, |last| last.min(index)));
                        if fault.as_ref().is_some_and(|f| f.index > index) {
                            fault = None;
                        }
                    }
                }
                Err(PipelineError::Unit(page_fault)) => {
                    pending.remove(&page_fault.index);
                    if last_page.is_some_and(|last| page_fault.index > last) {
                        continue;
                    }
                    tracing::warn!(
                        feed = descriptor.name,
                        page = page_fault.index,
                        error = %page_fault.error,
                        "Page fault, stopping feed"
                    );
                    last_page = Some(page_fault.index);
                    fault = Some(page_fault);
                }
                Err(PipelineError::Panicked(message)) => {
                    panic!("page worker panicked: {}", message);
                }
                Err(PipelineError::CapacityExceeded { capacity }) => {
                    error = Some(FeedError::CapacityExceeded(capacity));
                    break 'run;
                }
                Err(PipelineError::Closed) => {
                    error = Some(FeedError::Cancelled);
                    break 'run;
                }
            }
        }
    }

    if let Some(page_fault) = fault {
        if error.is_none() {
            error = Some(page_fault.error.clone());
        }
        aggregator.record_fault(page_fault.into_page());
    }

    // Pages past the end or the song limit are not merged; cut their
    // fetches short and wait them out
    workers_cancel.cancel();
    if cancel.is_cancelled() {
        let discarded = pipeline.abort();
        tracing::debug!(feed = descriptor.name, discarded, "Aborted in-flight pages");
    } else {
        let discarded = pipeline.drain().await.len();
        if discarded > 0 {
            tracing::debug!(feed = descriptor.name, discarded, "Discarded in-flight pages");
        }
    }

    if cancel.is_cancelled() && error.is_none() {
        error = Some(FeedError::Cancelled);
    }
    let state = match &error {
        None => DriverState::Completed,
        Some(FeedError::Cancelled) => DriverState::Cancelled,
        Some(_) => DriverState::Failed,
    };
    run.enter(state);

    let result = aggregator.finish(state, error);
    tracing::info!(
        feed = descriptor.name,
        songs = result.songs.len(),
        pages = result.pages_checked,
        success = result.success,
        "Feed run finished"
    );
    result
}

// ============================================================================
// Page worker
// ============================================================================

/// Fetches and parses one page, honoring the route's rate limit.
struct PageWorker {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    throttle: ThrottlePolicy,
    descriptor: &'static FeedDescriptor,
    options: ParseOptions,
    cancel: CancellationToken,
}

impl PageWorker {
    async fn run(&self, job: PageJob) -> Result<PageResult, PageFault> {
        match self.fetch_items(&job.url).await {
            Ok(items) => Ok(PageResult::new(job.url, job.index, items)),
            Err(error) => Err(PageFault {
                index: job.index,
                url: job.url,
                error,
            }),
        }
    }

    async fn fetch_items(&self, url: &Url) -> Result<Vec<NormalizedItem>, FeedError> {
        let response = self.fetch(url).await?;
        (self.descriptor.parse)(&response.body, url, &self.options)
            .map_err(|e| FeedError::parse(url.as_str(), e))
    }

    async fn fetch(&self, url: &Url) -> Result<TransportResponse, FeedError> {
        let route = route_key(url);
        let mut retries = 0;

        loop {
            self.wait_for_budget(url, &route).await?;

            let response = self
                .transport
                .get(url, &self.cancel)
                .await
                .map_err(|e| FeedError::transport(url.as_str(), e))?;
            let reported = self.limiter.record_headers(&route, &response.headers);

            if response.is_success() {
                return Ok(response);
            }
            if response.status != TOO_MANY_REQUESTS {
                return Err(FeedError::transport(
                    url.as_str(),
                    TransportError::HttpStatus(response.status),
                ));
            }
            if retries >= self.throttle.max_retries {
                let wait_secs = match self.limiter.should_throttle(&route) {
                    Throttle::Wait(wait) => wait.as_secs().max(1),
                    Throttle::Proceed => self.throttle.retry_backoff.as_secs().max(1),
                };
                return Err(FeedError::transport(
                    url.as_str(),
                    TransportError::RateLimited { wait_secs },
                ));
            }

            retries += 1;
            tracing::debug!(url = %url, attempt = retries, "Too many requests, retrying");
            if reported.is_none() {
                self.sleep(self.throttle.retry_backoff).await?;
            }
        }
    }

    async fn wait_for_budget(&self, url: &Url, route: &str) -> Result<(), FeedError> {
        let Throttle::Wait(wait) = self.limiter.should_throttle(route) else {
            return Ok(());
        };
        if wait > self.throttle.max_wait {
            return Err(FeedError::transport(
                url.as_str(),
                TransportError::RateLimited {
                    wait_secs: wait.as_secs().max(1),
                },
            ));
        }
        tracing::debug!(
            route = %route,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit reset"
        );
        self.sleep(wait).await
    }

    async fn sleep(&self, duration: Duration) -> Result<(), FeedError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FeedError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
