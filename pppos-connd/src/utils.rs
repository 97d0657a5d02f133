use color_eyre::{eyre::eyre, Result};
use std::{future::Future, time::Duration};
use tokio::{
    process::Command,
    time::{self, Instant},
};

pub async fn run_cmd(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let err = String::from_utf8_lossy(&output.stderr);
        let args = args.join(" ");
        Err(eyre!("Failed to run {cmd} {args}. Error {err}"))
    }
}

/// `f` returns a plain future so that callers may borrow into it and still
/// be awaited from a `Send` context.
pub async fn retry_for<F, Fut, K>(timeout: Duration, backoff: Duration, f: F) -> Result<K>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<K>>,
{
    let start = Instant::now();

    loop {
        match f().await {
            Err(e) => {
                if start.elapsed() >= timeout {
                    return Err(e);
                }

                time::sleep(backoff).await;
            }

            Ok(m) => return Ok(m),
        }
    }
}

/// Zero means "wait forever".
pub fn secs_or_unbounded(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
