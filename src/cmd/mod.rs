//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`, `InitDb` |
//! | `watch`   | `Watch`          |
//! | `config`  | `Config`         |

pub mod config;
pub mod serve;
pub mod watch;

pub use config::cmd_config;
pub use serve::{cmd_init_db, cmd_serve};
pub use watch::cmd_watch;
