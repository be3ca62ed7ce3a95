// Data Engine Module
// Universal abstraction layer over the five backend protocols

pub mod drivers;
pub mod error;
pub mod registry;
pub mod session_manager;
pub mod stager;
pub mod traits;
pub mod transport;
pub mod types;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use registry::DriverRegistry;
pub use session_manager::{DisconnectReport, SessionInfo, SessionLease, SessionManager};
pub use stager::{ReleaseReport, RemoteFileStager};
pub use traits::DataEngine;
pub use transport::{FileTransport, SftpTransport};
pub use types::*;
