use tokio::signal;

/// Resolves once the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        let _ = signal::ctrl_c().await;
    };

    tokio::select! {
        _ = interrupt => {},
        _ = terminate() => {},
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            // Without a SIGTERM handler the interrupt arm still works.
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::shutdown_signal;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout, Duration};

    static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

    #[cfg(unix)]
    async fn assert_signal_unblocks(signal: libc::c_int) {
        let handle = tokio::spawn(async { shutdown_signal().await });
        sleep(Duration::from_millis(50)).await;
        unsafe {
            libc::raise(signal);
        }
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("timeout")
            .expect("join");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn shutdown_signal_handles_sigterm() {
        let _guard = SIGNAL_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_signal_unblocks(libc::SIGTERM).await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn shutdown_signal_handles_sigint() {
        let _guard = SIGNAL_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_signal_unblocks(libc::SIGINT).await;
    }
}
