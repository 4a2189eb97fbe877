mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Code;

use common::TestCa;
use teleworker::grpc::JobServer;
use teleworker::proto::job_service_client::JobServiceClient;
use teleworker::proto::stream_job_output_request::StreamLimit;
use teleworker::proto::stream_job_output_response::Response as FramePayload;
use teleworker::proto::{
    GetJobRequest, Job as ProtoJob, StopJobRequest, StreamJobOutputRequest, SubmitJobRequest,
};
use teleworker::tls::TlsIdentity;
use teleworker::worker::{Config, Worker};

struct TestServer {
    addr: SocketAddr,
    server_ca: TestCa,
    client_ca: TestCa,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let server_ca = TestCa::new();
        let client_ca = TestCa::new();
        let (server_cert, server_key) = server_ca.issue_server("localhost");
        let tls = TlsIdentity::from_pem(client_ca.cert_pem(), server_cert, server_key);

        let worker = Arc::new(Worker::new(Config::default()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = JobServer::new(listener, worker, tls.server_tls_config());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.run(token).await;
        });

        Self {
            addr,
            server_ca,
            client_ca,
            shutdown,
        }
    }

    fn dial_with(&self, cert_pem: String, key_pem: String) -> JobServiceClient<Channel> {
        let tls = TlsIdentity::from_pem(self.server_ca.cert_pem(), cert_pem, key_pem);
        let channel = Channel::from_shared(format!("https://localhost:{}", self.addr.port()))
            .unwrap()
            .tls_config(tls.client_tls_config("localhost"))
            .unwrap()
            .connect_lazy();
        JobServiceClient::new(channel)
    }

    /// Client authenticated under the given namespace (certificate OU).
    fn dial(&self, ou: &str) -> JobServiceClient<Channel> {
        let (cert, key) = self.client_ca.issue_client(ou);
        self.dial_with(cert, key)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn job_request(command: &[&str]) -> SubmitJobRequest {
    SubmitJobRequest {
        job: Some(ProtoJob {
            command: command.iter().map(|part| part.to_string()).collect(),
            ..Default::default()
        }),
    }
}

async fn submit(client: &mut JobServiceClient<Channel>, command: &[&str]) -> ProtoJob {
    client
        .submit_job(job_request(command))
        .await
        .unwrap()
        .into_inner()
        .job
        .unwrap()
}

async fn get_job(
    client: &mut JobServiceClient<Channel>,
    job_id: &str,
    include_output: bool,
) -> ProtoJob {
    client
        .get_job(GetJobRequest {
            job_id: job_id.to_string(),
            include_stdout: include_output,
            include_stderr: include_output,
        })
        .await
        .unwrap()
        .into_inner()
        .job
        .unwrap()
}

async fn submit_and_wait(client: &mut JobServiceClient<Channel>, command: &[&str]) -> ProtoJob {
    let job = submit(client, command).await;
    timeout(Duration::from_secs(30), async {
        loop {
            sleep(Duration::from_millis(100)).await;
            let current = get_job(client, &job.id, false).await;
            if current.exit_code.is_some() {
                return current;
            }
        }
    })
    .await
    .expect("job did not complete in time")
}

/// Collected frames of a full StreamJobOutput call.
struct StreamedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    past_stdout: Vec<u8>,
    exit_code: Option<i32>,
    frames_after_exit: usize,
}

async fn stream_output(
    client: &mut JobServiceClient<Channel>,
    job_id: &str,
    from_beginning: bool,
    stream_limit: Option<StreamLimit>,
) -> StreamedOutput {
    let mut stream = client
        .stream_job_output(StreamJobOutputRequest {
            job_id: job_id.to_string(),
            from_beginning,
            stream_limit,
        })
        .await
        .unwrap()
        .into_inner();
    let mut collected = StreamedOutput {
        stdout: Vec::new(),
        stderr: Vec::new(),
        past_stdout: Vec::new(),
        exit_code: None,
        frames_after_exit: 0,
    };
    while let Some(message) = timeout(Duration::from_secs(30), stream.message())
        .await
        .expect("stream stalled")
        .unwrap()
    {
        if collected.exit_code.is_some() {
            collected.frames_after_exit += 1;
        }
        match message.response.unwrap() {
            FramePayload::Stdout(data) => {
                assert!(
                    !message.past || from_beginning,
                    "past frame without from_beginning"
                );
                if message.past {
                    collected.past_stdout.extend_from_slice(&data);
                }
                collected.stdout.extend_from_slice(&data);
            }
            FramePayload::Stderr(data) => {
                collected.stderr.extend_from_slice(&data);
            }
            FramePayload::CompletedExitCode(code) => {
                assert!(collected.exit_code.is_none(), "duplicate terminal frame");
                collected.exit_code = Some(code);
            }
        }
    }
    collected
}

#[tokio::test]
async fn test_job_lifecycle_and_namespace_isolation() {
    let server = TestServer::start().await;
    let mut client1 = server.dial("client1");
    let mut client2 = server.dial("client2");

    let job1 = submit_and_wait(
        &mut client1,
        &["sh", "-c", "printf stdout1 && printf stderr1 1>&2 && exit 101"],
    )
    .await;
    let job2 = submit_and_wait(
        &mut client2,
        &["sh", "-c", "printf stdout2 && printf stderr2 1>&2 && exit 102"],
    )
    .await;

    assert!(!job1.id.is_empty());
    assert_eq!(
        job1.command,
        ["sh", "-c", "printf stdout1 && printf stderr1 1>&2 && exit 101"]
    );
    assert!(job1.root_fs.is_empty());
    assert!(job1.created_at.is_some());
    assert_ne!(job1.pid, 0);

    let full = get_job(&mut client1, &job1.id, true).await;
    assert_eq!(full.stdout, b"stdout1");
    assert_eq!(full.stderr, b"stderr1");
    assert_eq!(full.exit_code, Some(101));

    let full = get_job(&mut client2, &job2.id, true).await;
    assert_eq!(full.stdout, b"stdout2");
    assert_eq!(full.stderr, b"stderr2");
    assert_eq!(full.exit_code, Some(102));

    // Client 1 cannot see client 2's job
    let err = client1
        .get_job(GetJobRequest {
            job_id: job2.id.clone(),
            include_stdout: true,
            include_stderr: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // A client not signed by the configured client CA fails at the transport
    // layer, before reaching any handler
    let (cert, key) = server.server_ca.issue_client("client3");
    let mut client3 = server.dial_with(cert, key);
    let err = client3
        .get_job(GetJobRequest {
            job_id: "some id".to_string(),
            include_stdout: false,
            include_stderr: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_stream_from_beginning_reconstructs_output() {
    let server = TestServer::start().await;
    let mut client = server.dial("client1");
    let job = submit_and_wait(
        &mut client,
        &["sh", "-c", "printf stdout1 && printf stderr1 1>&2 && exit 101"],
    )
    .await;

    let streamed = stream_output(&mut client, &job.id, true, None).await;
    assert_eq!(streamed.stdout, b"stdout1");
    assert_eq!(streamed.stderr, b"stderr1");
    assert_eq!(streamed.past_stdout, b"stdout1");
    assert_eq!(streamed.exit_code, Some(101));
    // The terminal frame is the last frame
    assert_eq!(streamed.frames_after_exit, 0);
}

#[tokio::test]
async fn test_stream_live_output_until_completion() {
    let server = TestServer::start().await;
    let mut client = server.dial("client1");
    let job = submit(
        &mut client,
        &[
            "sh",
            "-c",
            "printf a; sleep 0.2; printf b; sleep 0.2; printf c",
        ],
    )
    .await;

    // Streamed live from (at latest) the first chunk; anything emitted before
    // the stream started is not requested, so the result is a suffix
    let streamed = stream_output(&mut client, &job.id, false, None).await;
    assert_eq!(streamed.exit_code, Some(0));
    assert!(
        b"abc".ends_with(&streamed.stdout),
        "expected a suffix of abc, got {:?}",
        streamed.stdout
    );

    // From the beginning after completion the full output reconstructs
    let streamed = stream_output(&mut client, &job.id, true, None).await;
    assert_eq!(streamed.stdout, b"abc");
}

#[tokio::test]
async fn test_stream_limit_selects_single_stream() {
    let server = TestServer::start().await;
    let mut client = server.dial("client1");
    let job = submit_and_wait(
        &mut client,
        &["sh", "-c", "printf out && printf err 1>&2"],
    )
    .await;

    let streamed = stream_output(
        &mut client,
        &job.id,
        true,
        Some(StreamLimit::OnlyStdout(true)),
    )
    .await;
    assert_eq!(streamed.stdout, b"out");
    assert!(streamed.stderr.is_empty());
    assert_eq!(streamed.exit_code, Some(0));

    let streamed = stream_output(
        &mut client,
        &job.id,
        true,
        Some(StreamLimit::OnlyStderr(true)),
    )
    .await;
    assert!(streamed.stdout.is_empty());
    assert_eq!(streamed.stderr, b"err");
    assert_eq!(streamed.exit_code, Some(0));
}

#[tokio::test]
async fn test_submit_validation() {
    let server = TestServer::start().await;
    let mut client = server.dial("client1");

    let cases: Vec<ProtoJob> = vec![
        // Empty command
        ProtoJob::default(),
        ProtoJob {
            command: vec!["true".to_string()],
            created_at: Some(prost_types::Timestamp::default()),
            ..Default::default()
        },
        ProtoJob {
            command: vec!["true".to_string()],
            pid: 42,
            ..Default::default()
        },
        ProtoJob {
            command: vec!["true".to_string()],
            stdout: b"data".to_vec(),
            ..Default::default()
        },
        ProtoJob {
            command: vec!["true".to_string()],
            stderr: b"data".to_vec(),
            ..Default::default()
        },
        ProtoJob {
            command: vec!["true".to_string()],
            exit_code: Some(0),
            ..Default::default()
        },
    ];
    for job in cases {
        let err = client
            .submit_job(SubmitJobRequest { job: Some(job.clone()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "case: {job:?}");
    }

    // root_fs is rejected on a worker running without limits
    let err = client
        .submit_job(SubmitJobRequest {
            job: Some(ProtoJob {
                command: vec!["true".to_string()],
                root_fs: "/tmp".to_string(),
                ..Default::default()
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
}

#[tokio::test]
async fn test_stop_job() {
    let server = TestServer::start().await;
    let mut client = server.dial("client1");
    let job = submit(&mut client, &["sleep", "60"]).await;

    let stopped = client
        .stop_job(StopJobRequest {
            job_id: job.id.clone(),
            force: false,
        })
        .await
        .unwrap()
        .into_inner()
        .job
        .unwrap();
    // Killed by signal, so no decodable exit code
    assert_eq!(stopped.exit_code, Some(-1));

    // Stopping an already-completed job is a precondition failure
    let err = client
        .stop_job(StopJobRequest {
            job_id: job.id.clone(),
            force: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Lookup failures for stop mirror get
    let err = client
        .stop_job(StopJobRequest {
            job_id: String::new(),
            force: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = client
        .stop_job(StopJobRequest {
            job_id: "missing".to_string(),
            force: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_duplicate_ids_across_namespaces() {
    let server = TestServer::start().await;
    let mut client1 = server.dial("client1");
    let mut client2 = server.dial("client2");

    let request = SubmitJobRequest {
        job: Some(ProtoJob {
            id: "shared-id".to_string(),
            command: vec!["sleep".to_string(), "5".to_string()],
            ..Default::default()
        }),
    };

    client1.submit_job(request.clone()).await.unwrap();
    // Same id, same namespace: rejected
    let err = client1.submit_job(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
    // Same id, different namespace: accepted
    client2.submit_job(request).await.unwrap();
}

#[tokio::test]
async fn test_clients_without_ou_share_empty_namespace() {
    let server = TestServer::start().await;
    let (cert, key) = server.client_ca.issue_client_without_ou();
    let mut client1 = server.dial_with(cert, key);
    let (cert, key) = server.client_ca.issue_client_without_ou();
    let mut client2 = server.dial_with(cert, key);

    let job = submit_and_wait(&mut client1, &["true"]).await;
    let seen = get_job(&mut client2, &job.id, false).await;
    assert_eq!(seen.id, job.id);

    // A namespaced client cannot see the empty namespace
    let mut namespaced = server.dial("client1");
    let err = namespaced
        .get_job(GetJobRequest {
            job_id: job.id,
            include_stdout: false,
            include_stderr: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}
