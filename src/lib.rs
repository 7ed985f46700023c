//! Hopline - service-to-service messaging over a topic broker.
//!
//! A thin facade for microservice messaging: competing-consumer commands
//! (`listen`/`send`), per-service broadcast (`subscribe`/`publish`), and
//! synchronous RPC-style sends with correlation ids and deadlines.

pub mod completion;
pub mod config;
pub mod error;
pub mod error_format;
pub mod group;
pub mod handler;
pub mod message;
pub mod routing;
pub mod service;
pub mod timeout;
pub mod transport;

mod broadcast;
mod dispatch;
mod rpc;

pub use config::{AmqpSettings, BusConfig, ConfigError, TransportType};
pub use error::{BusError, Result};
pub use error_format::{default_error_formatter, ErrorFormatter, HandlerFailure, RemoteError};
pub use handler::{async_handler, sync_handler, Handler, HandlerResult, Outcome};
pub use message::{Headers, Message};
pub use routing::DeliveryMode;
pub use service::{SendOptions, Service, ServiceConfig, DEFAULT_CALL_TIMEOUT};
pub use transport::{init_transport, MemoryTransport, Transport};
