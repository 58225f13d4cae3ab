#![allow(dead_code)]

use std::io;
use std::num::ParseIntError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer is too small")]
    ErrBufferTooSmall,

    //RTP
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("packet is too short to be RTP packet")]
    ErrTooShortRtp,
    #[error("unsupported RTP version {0}")]
    ErrInvalidRtpVersion(u8),
    #[error("invalid RTP padding")]
    ErrInvalidPadding,
    #[error("h.ExtensionProfile must be 0xBEDE or 0x1000 to use header extensions")]
    ErrHeaderExtensionsNotEnabled,
    #[error("extension not found")]
    ErrHeaderExtensionNotFound,
    #[error("header extension id must be between 1 and 14 for RFC 5285 one byte extensions")]
    ErrRfc8285OneByteHeaderIdRange,
    #[error("header extension payload must be 16bytes or less for RFC 5285 one byte extensions")]
    ErrRfc8285OneByteHeaderSize,
    #[error("header extension id must be between 1 and 255 for RFC 5285 two byte extensions")]
    ErrRfc8285TwoByteHeaderIdRange,
    #[error("header extension payload must be 255bytes or less for RFC 5285 two byte extensions")]
    ErrRfc8285TwoByteHeaderSize,
    #[error("header extension id must be 0 for non-RFC 5285 extensions")]
    ErrRfc3550HeaderIdRange,
    #[error("header extension payload must be 32-bit aligned")]
    HeaderExtensionPayloadNot32BitWords,

    //RTX
    #[error("unable to spawn retransmission dispatch task: {0}")]
    ErrDispatchTaskSpawn(String),
    #[error("retransmission dispatch task panicked")]
    ErrDispatchTaskPanicked,
    #[error("invalid map entry {0:?}, expected <key>:<value>")]
    ErrInvalidMapEntry(String),

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("mutex poison: {0}")]
    PoisonError(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
