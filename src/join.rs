//! Helpers for reaping watcher tasks

use tokio::task::{JoinError, JoinSet};

// Re-raises a panic from a watcher task on the reaping task. Cancelled tasks
// are ignored.
pub(crate) fn propagate_panics(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) if err.is_panic() => {
            std::panic::resume_unwind(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error from watcher task: {err}");
        }
    }
}

/// Reaps every task in `tasks` which has already exited, without waiting.
pub(crate) fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        propagate_panics(result);
    }
}

/// Waits for every task in `tasks` to exit.
pub(crate) async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        propagate_panics(result);
    }
}
