use std::sync::Arc;
use std::time::Duration;

use scribe_infra::jobs::{
    DispatcherConfig, InMemoryJobStore, JobDispatcher, JobGateway, JobStateMachine, JobStore,
    JobStoreError, PostgresJobStore,
};
use scribe_infra::{Transcriber, UploadStore};

use crate::config::{AppConfig, JobStoreKind};

/// Store shared by the gateway and the dispatcher, whichever backend it is.
pub type SharedJobStore = Arc<dyn JobStore>;

/// State shared by all request handlers.
pub struct AppServices {
    pub gateway: JobGateway<SharedJobStore>,
    pub request_timeout: Duration,
}

/// The request-side services plus the not-yet-started worker pool. Both sit
/// on the same state machine, so completions wake waiting requests directly.
pub struct Wiring {
    pub services: Arc<AppServices>,
    pub dispatcher: JobDispatcher<SharedJobStore>,
}

pub async fn build_services(
    config: &AppConfig,
    transcriber: Arc<dyn Transcriber>,
) -> Result<Wiring, JobStoreError> {
    let store: SharedJobStore = match config.job_store {
        JobStoreKind::Postgres => {
            tracing::info!("using postgres job store");
            Arc::new(PostgresJobStore::connect(&config.database_url).await?)
        }
        JobStoreKind::Memory => {
            tracing::warn!("JOB_STORE=memory; jobs are lost on restart");
            InMemoryJobStore::arc()
        }
    };

    let machine = Arc::new(JobStateMachine::new(store));

    let gateway = JobGateway::new(
        machine.clone(),
        UploadStore::new(&config.upload_dir),
        &config.task_queue,
    );

    let dispatcher = JobDispatcher::new(
        machine,
        transcriber,
        DispatcherConfig::default()
            .with_name(format!("{}-dispatcher", config.task_queue.to_lowercase()))
            .with_queue(&config.task_queue)
            .with_workers(config.worker_count)
            .with_policy(config.retry.clone()),
    );

    Ok(Wiring {
        services: Arc::new(AppServices {
            gateway,
            request_timeout: config.request_timeout,
        }),
        dispatcher,
    })
}
