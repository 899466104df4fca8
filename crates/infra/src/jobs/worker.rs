use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use entitle_messaging::{Delivery, MessageTransport, Subscription};

use crate::settings::JobSettings;

use super::dispatcher::JOB_KEY_PROPERTY;
use super::manager::JobManager;
use super::types::JobMessage;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A job already executing is allowed to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Thread name, also used in logs
    pub name: String,
    /// How long to wait for a message before re-checking for shutdown
    pub poll_interval: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl JobWorkerConfig {
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self::default().with_poll_interval(settings.worker_poll_interval)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Consumes job messages and executes them through a [`JobManager`].
///
/// - Decodes each delivery into a [`JobMessage`]
/// - Hands the job id to [`JobManager::execute_job`]
/// - Logs and skips undecodable messages and failed executions
#[derive(Debug)]
pub struct JobWorker;

impl JobWorker {
    /// Spawn a worker thread draining `subscription`.
    pub fn spawn<T>(
        config: JobWorkerConfig,
        subscription: Subscription<Delivery>,
        manager: Arc<JobManager<T>>,
    ) -> io::Result<WorkerHandle>
    where
        T: MessageTransport + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(&config, &subscription, &shutdown_rx, &manager))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<T: MessageTransport>(
    config: &JobWorkerConfig,
    sub: &Subscription<Delivery>,
    shutdown_rx: &mpsc::Receiver<()>,
    manager: &JobManager<T>,
) {
    info!(worker = %config.name, "job worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(config.poll_interval) {
            Ok(delivery) => handle_delivery(&config.name, &delivery, manager),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "job worker stopped");
}

fn handle_delivery<T: MessageTransport>(worker: &str, delivery: &Delivery, manager: &JobManager<T>) {
    let message: JobMessage = match serde_json::from_str(delivery.message().body()) {
        Ok(message) => message,
        Err(err) => {
            warn!(
                worker,
                address = delivery.address(),
                job_key = delivery.message().property(JOB_KEY_PROPERTY),
                error = %err,
                "discarding undecodable job message"
            );
            return;
        }
    };

    debug!(worker, job_id = %message.job_id(), job_key = message.job_key(), "received job message");

    match manager.execute_job(message.job_id()) {
        Ok(record) => debug!(
            worker,
            job_id = %record.id(),
            state = %record.state(),
            "job message handled"
        ),
        Err(err) => warn!(
            worker,
            job_id = %message.job_id(),
            job_key = message.job_key(),
            error = %err,
            "job execution failed"
        ),
    }
}
