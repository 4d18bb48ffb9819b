//! PeaDrop transfer engine core.
//! No I/O: wire headers, framing, item paths, slot allocation, progress accounting.

pub mod cursor;
pub mod item;
pub mod job;
pub mod protocol;
pub mod slots;
pub mod wire;

pub use cursor::{item_progress, Throughput, TransferCursor, DEFAULT_CHUNK_SIZE};
pub use item::{Item, ItemKind};
pub use job::{Direction, JobRole, JobSink, JobSnapshot, JobState, NullSink};
pub use protocol::{Header, Presence, APP_NAME, DEFAULT_PORT, PROTOCOL_VERSION};
pub use slots::{SlotAllocator, SlotError, DEFAULT_MAX_JOBS};
pub use wire::{
    encode_chunk, encode_frame, split_frame, Frame, FrameDecodeError, FrameDecoder,
    FrameEncodeError, MAX_PAYLOAD_LEN,
};
