pub mod backend;
pub mod feed;
pub mod records;

pub use backend::{Backend, BackendError};
pub use feed::{
    decode_frame, encode_frame, ChangeEnvelope, ChangeOp, DecodeReport, Entity, FrameDecoder,
    FrameError, DEFAULT_MAX_FRAME_BYTES,
};
pub use records::{
    Agent, AgentStatus, Command, CommandResult, CommandStatus, FileEntry, FileListing, LogEntry,
    LogSeverity, Screenshot,
};
