//! Messages exchanged between the pool driver and a worker process.
//!
//! Each message is one length-delimited frame holding a JSON document. The
//! driver writes requests to the worker's stdin and reads responses from its
//! stdout.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::Result;
use crate::job::JobId;

/// Exit status of a worker that outlived its deadline plus grace period.
pub const TIMEOUT_EXIT_CODE: i32 = 65;

const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WorkerRequest {
    RunJob {
        job_id: JobId,
        /// POSIX seconds
        deadline: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJobResponse {
    /// 1 if the job completed, 0 otherwise
    pub success: u32,
    /// Empty unless the job raised an OOPS
    pub oops_id: String,
}

impl RunJobResponse {
    pub fn completed() -> Self {
        Self {
            success: 1,
            oops_id: String::new(),
        }
    }

    pub fn incomplete(oops_id: Option<String>) -> Self {
        Self {
            success: 0,
            oops_id: oops_id.unwrap_or_default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.success != 0
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}
