//! The user service: domain logic, HTTP surfaces and node lifecycle

pub mod http;
pub mod node;
pub mod users;

pub use http::{internal_router, public_router, AppState};
pub use node::{build_cache_store, shutdown_signal, Node};
pub use users::{
    Gender, MemoryUserStore, ProfileUpdate, Registration, User, UserId, UserService, UserStatus,
    UserStore,
};
