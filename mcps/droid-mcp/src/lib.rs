//! Droid MCP - Android device orchestration over adb
//!
//! Requests flow from the MCP tool router ([`server`]) through the
//! [`dispatcher`], which resolves a device session in the [`registry`],
//! runs the operation through the [`bridge`] and optionally feeds the
//! captured frame to the [`recognition`] pipeline.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod params;
pub mod processing;
pub mod recognition;
pub mod registry;
pub mod response;
pub mod server;

pub use config::Config;
pub use dispatcher::{CommandRequest, CommandResult, Dispatcher, Method, RequestId};
pub use error::{DroidError, DroidResult, ErrorKind};
pub use server::DroidMcpServer;
