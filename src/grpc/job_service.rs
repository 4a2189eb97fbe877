use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use x509_parser::prelude::*;

use crate::error::WorkerError;
use crate::proto::job_service_server::JobService;
use crate::proto::stream_job_output_request::StreamLimit;
use crate::proto::stream_job_output_response::Response as FramePayload;
use crate::proto::{
    GetJobRequest, GetJobResponse, Job as ProtoJob, StopJobRequest, StopJobResponse,
    StreamJobOutputRequest, StreamJobOutputResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::worker::{Job, JobUpdate, Worker};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const READ_CHUNK: usize = 1024;

type Frame = Result<StreamJobOutputResponse, Status>;

/// gRPC job service backed by a [`Worker`]. Every call is scoped to the
/// namespace derived from the caller's client certificate.
pub struct WorkerService {
    worker: Arc<Worker>,
}

impl WorkerService {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// Looks up a job in the caller's namespace, failing with `NotFound` for
    /// anything the namespace cannot see.
    async fn fetch_job(&self, namespace: &str, job_id: &str) -> Result<Arc<Job>, Status> {
        if job_id.is_empty() {
            return Err(Status::invalid_argument("job ID required"));
        }
        match self.worker.get_job(namespace, job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(Status::not_found("not found")),
            Err(WorkerError::Shutdown) => Err(Status::failed_precondition("worker shutdown")),
            Err(err) => Err(Status::unknown(err.to_string())),
        }
    }
}

#[tonic::async_trait]
impl JobService for WorkerService {
    async fn get_job(
        &self,
        request: Request<GetJobRequest>,
    ) -> Result<Response<GetJobResponse>, Status> {
        let namespace = namespace_from_request(&request)?;
        let req = request.into_inner();
        let job = self.fetch_job(&namespace, &req.job_id).await?;
        let job = to_proto_job(&job, req.include_stdout, req.include_stderr).await?;
        Ok(Response::new(GetJobResponse { job: Some(job) }))
    }

    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let namespace = namespace_from_request(&request)?;
        let req = request.into_inner();
        let job = req
            .job
            .ok_or_else(|| Status::invalid_argument("job required"))?;
        if job.command.is_empty() {
            return Err(Status::invalid_argument(
                "at least one command value required",
            ));
        } else if job.created_at.is_some() {
            return Err(Status::invalid_argument(
                "created at cannot be present on create",
            ));
        } else if job.pid != 0 {
            return Err(Status::invalid_argument("PID cannot be present on create"));
        } else if !job.stdout.is_empty() {
            return Err(Status::invalid_argument(
                "stdout cannot be present on create",
            ));
        } else if !job.stderr.is_empty() {
            return Err(Status::invalid_argument(
                "stderr cannot be present on create",
            ));
        } else if job.exit_code.is_some() {
            return Err(Status::invalid_argument(
                "exit code cannot be present on create",
            ));
        }
        let root_fs = if job.root_fs.is_empty() {
            None
        } else {
            Some(job.root_fs.clone())
        };
        let submitted = self
            .worker
            .submit_job(
                &namespace,
                &job.id,
                &job.command[0],
                job.command[1..].to_vec(),
                root_fs,
            )
            .await
            .map_err(|err| match err {
                WorkerError::Shutdown => Status::failed_precondition("worker shutdown"),
                WorkerError::IdAlreadyExists => {
                    Status::already_exists("job with ID already exists")
                }
                other => Status::unknown(other.to_string()),
            })?;
        tracing::info!(namespace = %namespace, id = %submitted.id(), "Job submitted");
        let job = to_proto_job(&submitted, false, false).await?;
        Ok(Response::new(SubmitJobResponse { job: Some(job) }))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let namespace = namespace_from_request(&request)?;
        let req = request.into_inner();
        let job = self.fetch_job(&namespace, &req.job_id).await?;
        // Accept the race where the job completes between this check and the
        // stop call below
        if job.exit_code().await.is_some() {
            return Err(Status::failed_precondition("job already stopped"));
        }
        timeout(STOP_TIMEOUT, job.stop(req.force))
            .await
            .map_err(|_| Status::deadline_exceeded("failed stopping job within 3 seconds"))?;
        let job = to_proto_job(&job, false, false).await?;
        Ok(Response::new(StopJobResponse { job: Some(job) }))
    }

    type StreamJobOutputStream = ReceiverStream<Frame>;

    async fn stream_job_output(
        &self,
        request: Request<StreamJobOutputRequest>,
    ) -> Result<Response<Self::StreamJobOutputStream>, Status> {
        let namespace = namespace_from_request(&request)?;
        let req = request.into_inner();
        let job = self.fetch_job(&namespace, &req.job_id).await?;
        let (include_stdout, include_stderr) = match req.stream_limit {
            Some(StreamLimit::OnlyStdout(true)) => (true, false),
            Some(StreamLimit::OnlyStderr(true)) => (false, true),
            _ => (true, true),
        };

        // All frames funnel through one channel so sends stay serialized on
        // the single response stream
        let (frames, rx) = mpsc::channel::<Frame>(1);
        let mut producers = JoinSet::new();
        if include_stdout {
            producers.spawn(stream_output(
                job.clone(),
                frames.clone(),
                req.from_beginning,
                false,
            ));
        }
        if include_stderr {
            producers.spawn(stream_output(
                job.clone(),
                frames.clone(),
                req.from_beginning,
                true,
            ));
        }
        tokio::spawn(async move {
            while let Some(joined) = producers.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(err) => Err(Status::internal(format!("output producer failed: {err}"))),
                };
                if let Err(status) = result {
                    let _ = frames.send(Err(status)).await;
                    return;
                }
            }
            // Producers only finish cleanly once the exit code is recorded,
            // so the terminal frame always carries it
            let exit_code = job.exit_code().await.unwrap_or(-1);
            let _ = frames
                .send(Ok(StreamJobOutputResponse {
                    past: false,
                    response: Some(FramePayload::CompletedExitCode(exit_code)),
                }))
                .await;
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// The caller's namespace: the first OU of the leaf client certificate, empty
/// when the certificate carries no OU.
fn namespace_from_request<T>(request: &Request<T>) -> Result<String, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
    let cert = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
    let (_, cert) = X509Certificate::from_der(cert.as_ref())
        .map_err(|_| Status::unauthenticated("unreadable client certificate"))?;
    let namespace = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default();
    Ok(namespace.to_string())
}

async fn to_proto_job(
    job: &Job,
    include_stdout: bool,
    include_stderr: bool,
) -> Result<ProtoJob, Status> {
    let mut command = Vec::with_capacity(job.args().len() + 1);
    command.push(job.command().to_string());
    command.extend(job.args().iter().cloned());
    // The exit code is read before the output: if the job completes mid-call
    // the response shows output without a code rather than a code without all
    // of its output
    let exit_code = job.exit_code().await;
    let created_at = job.created_at();
    let mut proto = ProtoJob {
        id: job.id().to_string(),
        command,
        root_fs: job.root_fs().unwrap_or_default().to_string(),
        created_at: Some(prost_types::Timestamp {
            seconds: created_at.timestamp(),
            nanos: created_at.timestamp_subsec_nanos() as i32,
        }),
        pid: i64::from(job.pid().unwrap_or_default()),
        stdout: Vec::new(),
        stderr: Vec::new(),
        exit_code,
    };
    if include_stdout {
        proto.stdout = all_output(job, false).await?;
    }
    if include_stderr {
        proto.stderr = all_output(job, true).await?;
    }
    Ok(proto)
}

/// Drains the full captured output of one stream with a fixed chunk buffer.
async fn all_output(job: &Job, stderr: bool) -> Result<Vec<u8>, Status> {
    let mut out = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let (read, _, _) = job
            .read_output(stderr, &mut buf, out.len())
            .await
            .map_err(|err| Status::unknown(err.to_string()))?;
        if read == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..read]);
    }
}

/// Produces all frames for one stream: the past backlog first when requested,
/// then live output until the job completes.
async fn stream_output(
    job: Arc<Job>,
    frames: mpsc::Sender<Frame>,
    from_beginning: bool,
    stderr: bool,
) -> Result<(), Status> {
    // Probe with an empty buffer for the current length; everything up to it
    // is "past", everything after is live
    let mut empty = [0u8; 0];
    let (_, past_total, _) = job
        .read_output(stderr, &mut empty, 0)
        .await
        .map_err(|err| Status::unknown(err.to_string()))?;

    let mut buf = [0u8; READ_CHUNK];
    if from_beginning {
        let mut offset = 0;
        while offset < past_total {
            let want = READ_CHUNK.min(past_total - offset);
            let (read, _, _) = job
                .read_output(stderr, &mut buf[..want], offset)
                .await
                .map_err(|err| Status::unknown(err.to_string()))?;
            if read == 0 {
                break;
            }
            send_frame(&frames, stderr, buf[..read].to_vec(), true).await?;
            offset += read;
        }
    }

    // Buffer of 3 keeps one pending wake of each kind; dropped wakes are
    // harmless because the live loop drains to exhaustion on every pass
    let (updates, receiver) = mpsc::channel::<JobUpdate>(3);
    let listener = job.add_update_listener(updates).await;
    let result = stream_live(&job, &frames, stderr, past_total, receiver, &mut buf).await;
    job.remove_update_listener(listener).await;
    result
}

async fn stream_live(
    job: &Job,
    frames: &mpsc::Sender<Frame>,
    stderr: bool,
    mut offset: usize,
    mut updates: mpsc::Receiver<JobUpdate>,
    buf: &mut [u8],
) -> Result<(), Status> {
    loop {
        // Drain everything currently captured, then act on the exit code the
        // final read observed under the same lock as the empty result
        let exit_code = loop {
            let (read, _, exit_code) = job
                .read_output(stderr, buf, offset)
                .await
                .map_err(|err| Status::unknown(err.to_string()))?;
            if read == 0 {
                break exit_code;
            }
            offset += read;
            send_frame(frames, stderr, buf[..read].to_vec(), false).await?;
        };
        if exit_code.is_some() {
            return Ok(());
        }
        // Any update kind wakes the loop; extra wakes just cost an empty read
        if updates.recv().await.is_none() {
            return Err(Status::internal("job update channel closed"));
        }
    }
}

async fn send_frame(
    frames: &mpsc::Sender<Frame>,
    stderr: bool,
    data: Vec<u8>,
    past: bool,
) -> Result<(), Status> {
    let payload = if stderr {
        FramePayload::Stderr(data)
    } else {
        FramePayload::Stdout(data)
    };
    frames
        .send(Ok(StreamJobOutputResponse {
            past,
            response: Some(payload),
        }))
        .await
        .map_err(|_| Status::cancelled("response stream closed"))
}
