//! Result delivery channels
//!
//! Two interchangeable strategies, selected per target tool:
//! - `callback` - a transient loopback HTTP listener the agent POSTs to
//! - `file` - a well-known path the orchestrator polls for
//!
//! Both validate payloads against the caller-supplied schema in `payload`.

pub mod callback;
pub mod file;
pub mod payload;

pub use callback::{CallbackServer, CALLBACK_PATH};
pub use file::{FileResultChannel, FileWait};
pub use payload::{parse_payload, AgentResult, PayloadFormat, ResultSchema, TypedSchema};
