pub mod api;
pub mod backend;
pub mod config;
pub mod errors;
pub mod history;
pub mod models;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod session;

pub use api::build_router;
pub use backend::{BackendHandle, BackendKind, SessionBackend, ShellRequest};
pub use history::HistoryStore;
pub use runtime::ContainerRuntime;
pub use service::{AppState, ContainerService};
pub use session::SessionManager;

pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_RUNTIME: &str = "docker";
