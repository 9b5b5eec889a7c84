//! Peer-to-peer protocol errors.

use std::fmt::Debug;
use std::io;

use crossbeam_channel as crossbeam;

use herald_common::block::tree;

use thiserror::Error;

/// An error occuring in the announcement service.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A block tree error.
    #[error("block tree error: {0}")]
    Tree(#[from] tree::Error),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    /// A session thread panicked.
    #[error("session thread panicked")]
    Panicked,

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl<T: Debug + Send + Sync + 'static> From<crossbeam::SendError<T>> for Error {
    fn from(err: crossbeam::SendError<T>) -> Self {
        Self::Channel(Box::new(err))
    }
}

impl From<crossbeam::RecvError> for Error {
    fn from(err: crossbeam::RecvError) -> Self {
        Self::Channel(Box::new(err))
    }
}

impl From<crossbeam::RecvTimeoutError> for Error {
    fn from(err: crossbeam::RecvTimeoutError) -> Self {
        Self::Channel(Box::new(err))
    }
}
