//! Domain model (kinds, descriptors, events, records, ids).

pub mod descriptor;
pub mod event;
pub mod ids;
pub mod kind;
pub mod record;

pub use descriptor::Descriptor;
pub use event::{Body, DispatchResponse, Event, Reply, ReplyState};
pub use ids::RecordId;
pub use kind::FunctionKind;
pub use record::{FunctionRecord, FunctionSummary};
