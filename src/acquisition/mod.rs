//! Time-domain acquisition.

pub mod lockin;

pub use lockin::{
    AcquisitionRun, LockInConfig, LockInSampler, Phase, Sample, Segment, SegmentReport,
};
