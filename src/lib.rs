//! zmx: in-band ZMODEM for terminal byte streams.
//!
//! Watch a terminal stream with [`Detector`], then hand the stream to
//! [`start_receive`] or [`start_send`] and follow the transfer through an
//! [`EventSink`].

pub mod config;
pub mod error;
pub mod zmodem;

pub use config::TransferConfig;
pub use error::{CodecError, FrameError, Result, ZmodemError};
pub use zmodem::{
    start_receive, start_send, CancelToken, ChannelSink, DetectionResult, Detector, EventSink,
    TransferEvent, TransferHandle, TransferStats,
};
