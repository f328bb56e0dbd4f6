pub mod client;
pub mod connectivity;
pub mod error;
pub mod http_admin;
pub mod metrics;

pub use client::{HttpMutationClient, HttpRefresher, Refresher, RemoteMutationClient};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, NetworkSignal, SwitchSignal};
pub use error::{classify_status, FailureClass, RemoteError};
pub use http_admin::{run_http_admin, serve_http_admin};
