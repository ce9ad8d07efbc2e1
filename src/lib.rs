//! A small multi-loop TCP server framework.
//!
//! An [`Acceptor`] hands every accepted connection to the next [`EventLoop`] of an
//! [`EventLoopGroup`] as a [`Channel`]. The channel's receive loop runs entirely on that loop,
//! wrapping each receive in a pooled [`Buffer`] and passing it through the connection's
//! [`Pipeline`] of [`Handler`]s. Bytes are delivered raw; framing is up to the handlers.

// #![deny(rust_2018_idioms, warnings)]
#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
)]

mod acceptor;
pub use acceptor::{Acceptor, PipelineConfigurator};

mod buffer;
pub use buffer::Buffer;

mod buffer_pool;
pub use buffer_pool::{BufferPool, PoolStats, PooledMemory};

mod channel;
pub use channel::{AdaptiveSize, Channel, ChannelId, ChannelOptions};

pub mod config;
pub use config::ServerConfig;

mod error;
pub use error::{BufferError, Error};

mod event_loop;
pub use event_loop::{EventLoop, LocalTask, LoopState};

mod loop_group;
pub use loop_group::EventLoopGroup;

mod pipeline;
pub use pipeline::{ChannelListener, Handler, Pipeline};

mod reactor;
