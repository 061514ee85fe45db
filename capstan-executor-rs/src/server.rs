//! The executor's two long-running loops: repository updates and the
//! build-request lease loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capstan_rs::types::{BuildRequest, BuildRequestState, BuildResult, WorkerInfo};
use tracing::{debug, info, warn};

use crate::build::{retry_queue, BuildWorker};
use crate::builds::BuildHandle;
use crate::service::ExecutorContext;

const BUILD_LOOP_POLL: Duration = Duration::from_secs(5);

/// Serve the deduplicated repository update queue.
pub async fn run_update_loop(context: Arc<ExecutorContext>) {
    loop {
        let task = tokio::select! {
            task = context.update_queue.get() => task,
            _ = context.shutdown.cancelled() => return,
        };
        debug!(connection = %task.connection, project = %task.project, "updating repository");
        match context
            .merger
            .update_repo(&task.connection, &task.project, task.repo_state.as_ref())
            .await
        {
            Ok(branches) => {
                task.set_discovered(task.project.clone(), branches);
                task.set_complete(true);
            }
            Err(err) => {
                warn!(connection = %task.connection, project = %task.project, %err,
                      "repository update failed");
                task.set_complete(false);
            }
        }
    }
}

/// Lease build requests while sensors allow, spawning one worker per
/// request.
pub async fn run_build_loop(context: Arc<ExecutorContext>) {
    let zones = context.config.zone_filter();
    loop {
        if context.shutdown.is_cancelled() {
            return;
        }
        if context.take_work() {
            match context.queue.next(&zones).await {
                Ok(requests) => {
                    for request in requests {
                        // Sensors may have tripped while we were starting
                        // the previous build.
                        if !context.take_work() {
                            break;
                        }
                        lease_request(&context, request).await;
                    }
                }
                Err(err) => {
                    warn!(%err, "error listing build requests");
                    tokio::time::sleep(BUILD_LOOP_POLL).await;
                }
            }
        }
        tokio::select! {
            _ = context.wake.notified() => {}
            _ = tokio::time::sleep(BUILD_LOOP_POLL) => {}
            _ = context.shutdown.cancelled() => return,
        }
    }
}

async fn lease_request(context: &Arc<ExecutorContext>, mut request: BuildRequest) {
    match context.queue.lock(&request, false).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            debug!(build = %request.uuid, %err, "could not lock request");
            return;
        }
    }

    // The listing is cached; the lock may have succeeded because the
    // request completed and was unlocked in the meantime.
    if let Err(err) = context.queue.refresh(&mut request).await {
        debug!(build = %request.uuid, %err, "request vanished after lock");
        return;
    }
    if request.state != BuildRequestState::Requested {
        let _ = retry_queue(|| async { context.queue.unlock(&request).await }).await;
        return;
    }

    request.state = BuildRequestState::Running;
    request.worker_info = Some(WorkerInfo {
        hostname: context.hostname.clone(),
        log_port: context.log_port,
    });
    if let Err(err) = context.queue.update(&request).await {
        warn!(build = %request.uuid, %err, "could not start build request");
        let _ = retry_queue(|| async { context.queue.unlock(&request).await }).await;
        return;
    }

    let params = match context.queue.get_params(&request).await {
        Ok(params) => params,
        Err(err) => {
            complete_with_error(
                context,
                request,
                format!("could not load build params: {err}"),
            )
            .await;
            return;
        }
    };
    // Already ours; drop the blob to keep the queue small.
    if let Err(err) = context.queue.clear_params(&request).await {
        debug!(build = %request.uuid, %err, "could not clear params");
    }

    info!(build = %request.uuid, job = %request.job_name, "starting build");
    let handle = Arc::new(BuildHandle::new(request.uuid.clone()));
    context.registry.insert(handle.clone());
    let worker = BuildWorker::new(context.clone(), request, params, handle);
    tokio::spawn(worker.run());
}

/// Failure before the worker exists still produces a completion event so
/// the scheduler is not left waiting for a dead lease.
async fn complete_with_error(
    context: &Arc<ExecutorContext>,
    mut request: BuildRequest,
    detail: String,
) {
    warn!(build = %request.uuid, detail, "failing build before start");
    let mut result = BuildResult::error(detail);
    result.end_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64());

    request.state = BuildRequestState::Completed;
    let found =
        retry_queue(|| async { context.queue.update(&request).await }).await.is_ok();
    let lock_valid = context.queue.lock_valid(&request).await;
    if lock_valid {
        let _ = retry_queue(|| async { context.queue.unlock(&request).await }).await;
    }
    if found && lock_valid {
        let _ = retry_queue(|| async {
            context.queue.submit_completed_event(&request, &result).await
        })
        .await;
    }
}
