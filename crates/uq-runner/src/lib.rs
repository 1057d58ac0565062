//! Memoizing preprocess → simulate → postprocess pipeline for uncertainty
//! quantification runs, with optional distribution of sample batches over a
//! pool of remote hosts.

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod hosts;
pub mod pipeline;
pub mod remote;
pub mod sample;
pub mod setup;
pub mod split;
pub mod stages;
pub mod store;
pub mod supervisor;
pub mod timeline;
pub mod worker;

pub use cache::{QoiMap, RawResult, Stage, StageCache, EQUIVALENCE_TOLERANCE};
pub use dispatch::{load_file, DistReport, Dispatcher, Task};
pub use error::UqError;
pub use hosts::{Host, HostPool, HostsConfig};
pub use pipeline::{command_pipeline, BatchReport, InvalidSample, Pipeline};
pub use sample::{load_samples, ParamKey, Sample, TransformedKey, UnitKey};
pub use setup::Setup;
pub use split::{job_size, split_batch, Chunk};
pub use stages::{CommandStages, StageCommands, Stages, TimeWindow};
pub use store::{numbered_file_name, open_or_create, read_cache, write_cache};
pub use supervisor::{ChildOutcome, ChildRecord, ChildSupervisor, ResultFile, WorkerHandle};
pub use timeline::{stored_time_steps, window_time_steps, TIME_QOI};
pub use worker::{read_payload, run_command_worker, run_worker, WorkerPayload};
