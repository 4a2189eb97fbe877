use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, ServerTlsConfig};

use crate::grpc::job_service::WorkerService;
use crate::proto::job_service_server::JobServiceServer;
use crate::worker::Worker;

/// gRPC server exposing the job service over mTLS.
pub struct JobServer {
    listener: TcpListener,
    worker: Arc<Worker>,
    tls: ServerTlsConfig,
}

impl JobServer {
    pub fn new(listener: TcpListener, worker: Arc<Worker>, tls: ServerTlsConfig) -> Self {
        Self {
            listener,
            worker,
            tls,
        }
    }

    /// Serves until `shutdown` fires or the transport fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        Server::builder()
            .tls_config(self.tls)?
            .add_service(JobServiceServer::new(WorkerService::new(self.worker)))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(self.listener),
                shutdown.cancelled_owned(),
            )
            .await
    }
}
