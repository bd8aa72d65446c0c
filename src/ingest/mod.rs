//! Inbound messages: model, email parsing, attachment retrieval, project
//! routing, and the submission service.

pub mod attachments;
pub mod email;
pub mod model;
pub mod routing;
pub mod service;

pub use attachments::{AttachmentFetcher, FetchedAttachment, InlineAttachmentFetcher};
pub use email::parse_email;
pub use model::{Attachment, Channel, IngestEvent, NewIngestEvent, ProcessingStatus, RawPayload};
pub use routing::{ProjectRouter, RouteMatch};
pub use service::{IngestService, Submission};
