//! Cloud recognition with a primary provider and an optional fallback.

use std::{
    error, fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use keen_retry::{ExponentialJitter, ResolvedResult};
use tokio::time::{self, Instant};

use crate::{
    document::{PageTask, ProviderId},
    prelude::*,
    rate_limit::SlidingWindowLimiter,
    retry::{ProviderRetryResult, RetryPolicy, retry_result_fatal, retry_result_transient},
};

use super::{BackendKind, Recognition, RecognitionBackend, RecognitionError};

/// Text returned by a cloud provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderText {
    pub text: String,
    /// Confidence on a 0–100 scale. Providers convert at their boundary.
    pub confidence: f64,
}

/// A remote text recognition service.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Which provider is this?
    fn id(&self) -> ProviderId;

    /// Make one request to recognize `image`, classifying any failure as
    /// transient or fatal.
    async fn annotate(&self, task: &PageTask, image: &[u8]) -> ProviderRetryResult<ProviderText>;
}

/// Time limits for cloud recognition.
#[derive(Clone, Copy, Debug)]
pub struct CloudTimeouts {
    /// One request to one provider.
    pub request: Duration,
    /// One page, including retries, backoff and fallback, but not time spent
    /// waiting for the rate limiter.
    pub page: Duration,
}

/// A page ran out of time. Never retried, and never falls back.
#[derive(Debug)]
struct PageTimedOut;

impl fmt::Display for PageTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page ran out of time")
    }
}

impl error::Error for PageTimedOut {}

fn is_page_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PageTimedOut>().is_some()
}

/// Accounting for one page.
struct PageBudget {
    limit: Duration,
    started: Instant,
    /// Nanoseconds spent queued in the rate limiter.
    queued_nanos: AtomicU64,
    requests: AtomicU32,
}

impl PageBudget {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            started: Instant::now(),
            queued_nanos: AtomicU64::new(0),
            requests: AtomicU32::new(0),
        }
    }

    fn add_queued(&self, waited: Duration) {
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.queued_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Time left for this page, or `None` if it has run out.
    fn remaining(&self) -> Option<Duration> {
        let queued = Duration::from_nanos(self.queued_nanos.load(Ordering::Relaxed));
        let working = self.started.elapsed().saturating_sub(queued);
        self.limit.checked_sub(working).filter(|left| !left.is_zero())
    }

    fn requests(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Calls a primary provider, and a secondary one if the primary fails or
/// returns no text.
///
/// Each page is timed here rather than by the worker pool, because a page may
/// spend a long time queued behind the rate limiter before its first request.
pub struct CloudFallbackBackend {
    primary: Arc<dyn CloudProvider>,
    secondary: Option<Arc<dyn CloudProvider>>,
    limiter: Arc<SlidingWindowLimiter>,
    timeouts: CloudTimeouts,
    retry: RetryPolicy,
}

impl CloudFallbackBackend {
    pub fn new(
        primary: Arc<dyn CloudProvider>,
        secondary: Option<Arc<dyn CloudProvider>>,
        limiter: Arc<SlidingWindowLimiter>,
        timeouts: CloudTimeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            secondary,
            limiter,
            timeouts,
            retry,
        }
    }

    /// One rate-limited, time-limited request.
    async fn attempt(
        &self,
        provider: &dyn CloudProvider,
        task: &PageTask,
        image: &[u8],
        budget: &PageBudget,
    ) -> ProviderRetryResult<ProviderText> {
        // Don't spend a rate-limit slot on a page that is already out of time.
        if budget.remaining().is_none() {
            return retry_result_fatal(anyhow::Error::new(PageTimedOut));
        }
        let queued_at = Instant::now();
        self.limiter.acquire().await;
        budget.add_queued(queued_at.elapsed());
        let Some(remaining) = budget.remaining() else {
            return retry_result_fatal(anyhow::Error::new(PageTimedOut));
        };

        budget.requests.fetch_add(1, Ordering::Relaxed);
        let limit = self.timeouts.request.min(remaining);
        match time::timeout(limit, provider.annotate(task, image)).await {
            Ok(result) => result,
            Err(_) if limit < self.timeouts.request => {
                retry_result_fatal(anyhow::Error::new(PageTimedOut))
            }
            Err(_) => retry_result_transient(anyhow!(
                "{} request timed out after {}s",
                provider.id(),
                self.timeouts.request.as_secs()
            )),
        }
    }

    /// Call `provider`, retrying transient failures with backoff.
    async fn call_with_retries(
        &self,
        provider: &dyn CloudProvider,
        task: &PageTask,
        image: &[u8],
        budget: &PageBudget,
    ) -> Result<ProviderText> {
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: self.retry.backoff_range_millis.0
                ..=self.retry.backoff_range_millis.1,
            re_attempts: self.retry.re_attempts,
            jitter_ratio: 0.2,
        };
        let provider_id = provider.id();
        let result = self
            .attempt(provider, task, image, budget)
            .await
            .retry_with_async(|_| async {
                self.attempt(provider, task, image, budget).await
            })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    provider = %provider_id,
                    "succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    provider = %provider_id,
                    "gave up after {} retries with error {fatal_error:#}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }

    fn recognition(
        text: ProviderText,
        provider: ProviderId,
        fallback: bool,
        budget: &PageBudget,
    ) -> Recognition {
        Recognition {
            text: text.text,
            confidence: text.confidence,
            provider,
            fallback,
            detail: None,
            requests: budget.requests(),
        }
    }

    /// Convert a provider error, recognizing page timeouts.
    fn page_error(&self, err: anyhow::Error, budget: &PageBudget) -> RecognitionError {
        if is_page_timeout(&err) {
            RecognitionError::Timeout(self.timeouts.page)
        } else {
            RecognitionError::engine(&err, budget.requests())
        }
    }
}

#[async_trait]
impl RecognitionBackend for CloudFallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn manages_page_timeout(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip_all, fields(document = %task.document, page = task.page))]
    async fn recognize(&self, task: &PageTask) -> Result<Recognition, RecognitionError> {
        let image = task
            .image
            .read_bytes()
            .await
            .map_err(|err| RecognitionError::engine(&err, 0))?;
        let budget = PageBudget::new(self.timeouts.page);

        let primary_id = self.primary.id();
        let primary = self
            .call_with_retries(self.primary.as_ref(), task, &image, &budget)
            .await;
        let primary_problem = match &primary {
            Ok(text) if !text.text.trim().is_empty() => None,
            Ok(_) => Some("returned no text".to_owned()),
            // Out of time, so there's nothing left for a fallback.
            Err(err) if is_page_timeout(err) => {
                return Err(RecognitionError::Timeout(self.timeouts.page));
            }
            Err(err) => Some(format!("{err:#}")),
        };
        let Some(problem) = primary_problem else {
            return primary
                .map(|text| Self::recognition(text, primary_id, false, &budget))
                .map_err(|err| self.page_error(err, &budget));
        };

        let Some(secondary) = &self.secondary else {
            return match primary {
                Ok(text) => Ok(Self::recognition(text, primary_id, false, &budget)),
                Err(err) => Err(RecognitionError::engine(
                    &err.context(format!("{primary_id} failed")),
                    budget.requests(),
                )),
            };
        };

        let secondary_id = secondary.id();
        warn!(
            document = %task.document,
            page = task.page,
            "{} {}, falling back to {}",
            primary_id,
            problem,
            secondary_id
        );
        match self
            .call_with_retries(secondary.as_ref(), task, &image, &budget)
            .await
        {
            Ok(text) => Ok(Self::recognition(text, secondary_id, true, &budget)),
            // An empty primary result still beats no result at all.
            Err(_) if primary.is_ok() => primary
                .map(|text| Self::recognition(text, primary_id, false, &budget))
                .map_err(|err| RecognitionError::engine(&err, 0)),
            Err(secondary_err) if is_page_timeout(&secondary_err) => {
                Err(RecognitionError::Timeout(self.timeouts.page))
            }
            Err(secondary_err) => Err(RecognitionError::Engine {
                message: format!(
                    "{primary_id} failed: {problem}; {secondary_id} failed: {secondary_err:#}"
                ),
                requests: budget.requests(),
            }),
        }
    }
}
