pub mod chunker;
pub mod db_writer;
pub mod extract;
pub mod jobs;

pub use chunker::{chunk_text, Chunk};
pub use jobs::{FileStatus, IngestionJob, JobFile, JobRunner, JobStatus};
