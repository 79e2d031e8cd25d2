use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

/// Sleep primitive used between attempts. Swapped for a recording no-op in
/// tests.
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Exponential backoff parameters. `max_tries` sets how many times the
/// operation is retried after the first attempt.
///
/// The retry counter lives on the instance, so a shared configured backoff is
/// cloned per operation and each run starts from zero.
#[derive(Clone)]
pub struct Backoff {
    max_tries: u32,
    base: Duration,
    retry: u32,
    sleep: SleepFn,
}

impl Backoff {
    pub fn new(max_tries: u32, base: Duration) -> Self {
        Self {
            max_tries,
            base,
            retry: 0,
            sleep: Arc::new(|d| Box::pin(tokio::time::sleep(d))),
        }
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    /// Call `op` until it succeeds or `max_tries` retries have been performed.
    /// After every failure sleeps `base << min(retry, 8)`, i.e. doubling
    /// capped at 256x base. If all attempts fail the last error is returned.
    pub async fn run<T, E, F, Fut>(&mut self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let delay = self.base * (1 << self.retry.min(8));
                    (self.sleep)(delay).await;
                    self.retry += 1;
                    if self.retry > self.max_tries {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("max_tries", &self.max_tries)
            .field("base", &self.base)
            .field("retry", &self.retry)
            .finish()
    }
}
