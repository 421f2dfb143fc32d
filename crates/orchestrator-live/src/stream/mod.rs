//! Event stream plumbing: frame decoding, typed events, and the HTTP
//! transport that owns one streaming connection.
mod decoder;
mod event;
mod transport;

pub use decoder::{EventFrame, FrameDecoder};
pub use event::RunEvent;
pub use transport::{
    RunStreamOpener, StreamHandle, StreamObserver, StreamRequest, StreamSignal, StreamTransport,
};
