//! # Taskhub Worker
//!
//! 运行在任务 Pod 内的 addon 端工具：读取注入的环境变量，
//! 通过 Hub REST 接口获取任务、上报进度并上传命令输出。

pub mod client;
pub mod env;
pub mod error;
pub mod reporter;
pub mod streamer;

pub use client::HubClient;
pub use env::AddonEnv;
pub use error::{WorkerError, WorkerResult};
pub use reporter::TaskReporter;
pub use streamer::OutputStreamer;
