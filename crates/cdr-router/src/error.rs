use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Store error: {0}")]
    Store(#[from] cdr_store::StoreError),

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}
