use std::io;

/// Errors that can occur while bringing the server up.
///
/// Once the event loop is running, failures are scoped to individual
/// connections and never surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("could not bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("io operation failed")]
    Io(#[from] io::Error),
}
