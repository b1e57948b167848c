//! ZMODEM inside a terminal byte stream.
//!
//! # Architecture
//!
//! ```text
//! terminal bytes --> Detector --(match)--> start_receive / start_send
//!                                                 |
//!                                          worker task (owns stream)
//!                                                 |
//!                     FrameReader / FrameWriter  (link)
//!                                                 |
//!                       frame codec --> byte codec --> crc
//! ```
//!
//! The detector only watches; the host decides when to hand the stream to a
//! worker. Workers report through an [`EventSink`] and finish with exactly
//! one terminal event.

pub mod channel;
pub mod codec;
pub mod crc;
pub mod detector;
pub mod frame;
pub mod link;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

pub use channel::{
    ChannelSink, CompletedFile, EventReceiver, EventSink, NullSink, TransferContext,
    TransferEvent, TransferStats,
};
pub use codec::{unescape, Escaped, Escaper, Unescaped};
pub use crc::{crc16, crc32, Crc16, Crc32, CrcWidth};
pub use detector::{DetectionResult, Detector};
pub use frame::{
    decode_header, encode_subpacket, DataSubpacket, Frame, HeaderEncoding, SubpacketDecoder,
};
pub use link::{FrameReader, FrameWriter};
pub use protocol::{
    Capabilities, FileMetadata, FrameType, SubpacketTerminator, ZrinitFlags, ZsinitFlags,
};
pub use receiver::{Receiver, ReceiverState};
pub use sender::{Sender, SenderState};
pub use session::{start_receive, start_send, CancelToken, TransferHandle};
