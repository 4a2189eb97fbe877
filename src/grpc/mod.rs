pub mod job_service;
pub mod server;

pub use job_service::WorkerService;
pub use server::JobServer;
