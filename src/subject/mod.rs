//! Subject requests
//!
//! GDPR-style export and erasure requests for a single data subject.

pub mod export;
pub mod processor;
pub mod request;

pub use export::ExportBundle;
pub use processor::{
    SubjectRequestConfig, SubjectRequestProcessor, ERASURE_REASON, REQUEST_TARGET_TYPE,
    SUBJECT_REQUESTS_FILE,
};
pub use request::{RequestStatus, RequestType, SubjectRequest};
