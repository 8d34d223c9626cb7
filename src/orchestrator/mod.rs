//! Agent process orchestration: spawning, output reassembly and relay.

pub mod line_buffer;
pub mod protocol;
pub mod runner;

pub use line_buffer::LineBuffer;
pub use protocol::{EVENT_SENTINEL, OutputLine, classify};
pub use runner::{
    AgentCommand, BatchCallbacks, BatchCanceller, BatchHandle, BatchOutcome, CANCELLED_MESSAGE,
    DEFAULT_KILL_GRACE, IssueProcessor,
};
