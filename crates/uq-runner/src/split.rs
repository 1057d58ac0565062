use crate::sample::Sample;
use serde::{Deserialize, Serialize};

/// Contiguous run of samples handed to one worker. `start_index` is the id
/// of the first sample; ids of different chunks never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub start_index: u64,
    pub samples: Vec<Sample>,
}

/// `expected_total / parallelism`, never below one sample.
pub fn job_size(expected_total: usize, parallelism: usize) -> f64 {
    if parallelism == 0 {
        return expected_total.max(1) as f64;
    }
    (expected_total as f64 / parallelism as f64).max(1.0)
}

/// Cuts `samples` into chunks no larger than `job_size`, numbering them from
/// `first_index`. A batch that already fits is returned as a single chunk.
pub fn split_batch(samples: Vec<Sample>, job_size: f64, first_index: u64) -> Vec<Chunk> {
    let job_size = job_size.max(1.0);
    let len = samples.len();
    if len == 0 {
        return Vec::new();
    }
    if len as f64 <= job_size {
        return vec![Chunk {
            start_index: first_index,
            samples,
        }];
    }
    let num_chunks = (len as f64 / job_size).ceil() as usize;
    let chunk_size = len.div_ceil(num_chunks);

    let mut chunks = Vec::with_capacity(num_chunks);
    let mut rest = samples;
    let mut start = first_index;
    while !rest.is_empty() {
        let tail = rest.split_off(chunk_size.min(rest.len()));
        let head = std::mem::replace(&mut rest, tail);
        let taken = head.len() as u64;
        chunks.push(Chunk {
            start_index: start,
            samples: head,
        });
        start += taken;
    }
    chunks
}
