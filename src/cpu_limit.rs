//! Limiting how many CPU-hungry external processes run at once.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core. Each `tesseract` process keeps a core busy.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run `f` while holding a CPU permit.
///
/// Use this for external processes. In-process work should go through
/// [`spawn_blocking_propagating_panics`](crate::async_utils::spawn_blocking_propagating_panics)
/// instead, which Tokio already bounds.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("could not acquire CPU permit")?;
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_inner_result() {
        assert_eq!(with_cpu_semaphore(|| async { Ok(5) }).await.unwrap(), 5);
        assert!(
            with_cpu_semaphore(|| async { Err::<(), _>(anyhow!("nope")) })
                .await
                .is_err()
        );
    }
}
